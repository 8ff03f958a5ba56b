//! Fenced code block extraction from model replies.

use crate::errors::GenerationError;

#[derive(Debug, PartialEq)]
struct CodeBlock<'a> {
    lang: &'a str,
    body: String,
}

fn parse_blocks(text: &str) -> Result<Vec<CodeBlock<'_>>, GenerationError> {
    let mut blocks = Vec::new();
    let mut current: Option<(&str, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.as_mut() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    let lang = info.split_whitespace().next().unwrap_or("");
                    current = Some((lang, Vec::new()));
                }
            }
            Some((lang, body)) => {
                if trimmed.trim_end() == "```" {
                    blocks.push(CodeBlock {
                        lang: *lang,
                        body: body.join("\n"),
                    });
                    current = None;
                } else {
                    body.push(line);
                }
            }
        }
    }

    if current.is_some() {
        return Err(GenerationError::Parse {
            reason: "unterminated code fence".to_string(),
        });
    }
    Ok(blocks)
}

/// Reduce a model reply to exactly one code artifact.
///
/// One block is taken as is. With several, exactly one of them must carry
/// `expected_lang`; anything else is ambiguous.
pub fn extract_code_block(text: &str, expected_lang: &str) -> Result<String, GenerationError> {
    let blocks = parse_blocks(text)?;
    let chosen = match blocks.len() {
        0 => {
            return Err(GenerationError::Parse {
                reason: "no fenced code block in response".to_string(),
            });
        }
        1 => &blocks[0],
        n => {
            let tagged: Vec<&CodeBlock<'_>> = blocks
                .iter()
                .filter(|b| b.lang.eq_ignore_ascii_case(expected_lang))
                .collect();
            match tagged.as_slice() {
                [only] => *only,
                _ => {
                    return Err(GenerationError::Parse {
                        reason: format!(
                            "{} code blocks and {} tagged '{}'; cannot choose one",
                            n,
                            tagged.len(),
                            expected_lang
                        ),
                    });
                }
            }
        }
    };

    if chosen.body.trim().is_empty() {
        return Err(GenerationError::Parse {
            reason: "code block is empty".to_string(),
        });
    }
    Ok(chosen.body.clone())
}
