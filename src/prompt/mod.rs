//! Prompt compiler.
//!
//! Turns conversation history plus the current request into a bounded model
//! request. The instructions and the current request are mandatory; history
//! is added newest-first while it fits both the token budget and the history
//! window, then emitted oldest-first.

pub mod defaults;

pub use defaults::{default_parameters, effective_parameters};

use modelsmith_common::{Message, ModelType, Role};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::{LlmSection, PromptSection};
use crate::errors::PromptError;

/// Language tag the generation instructions ask for.
pub const CODE_LANGUAGE: &str = "python";

/// Allowed imports for generated code. Kept in sync with the sandbox policy.
pub const ALLOWED_MODULES: &[&str] = &[
    "math",
    "statistics",
    "datetime",
    "json",
    "decimal",
    "fractions",
    "itertools",
    "functools",
    "collections",
    "numpy",
    "pandas",
];

const GENERATION_INSTRUCTIONS: &str = "\
You are a financial forecasting assistant that writes Python forecast models.

Write exactly one fenced ```python code block and nothing else that looks like code.
The block must define a single entry point:

    def forecast(parameters, inputs):
        ...
        return {\"series\": [...]}

Rules:
- `parameters` is a dict of assumptions. `inputs` maps input names to tables of the
  form {\"columns\": [...], \"rows\": [[...], ...]}. Never fetch data yourself.
- Return a dict with either a \"series\" key (a list of numbers, one per period) or a
  \"table\" key ({\"columns\": [...], \"rows\": [[...]]}). An optional \"summary\" dict
  of headline figures may sit alongside.
- Only import from: {modules}.
- Do not read or write files, open network connections, spawn processes, or use
  eval, exec, compile, open, __import__, getattr, setattr, globals or locals.
- Do not print anything. Do not call forecast yourself.
- The result must depend only on `parameters` and `inputs` so reruns are reproducible.";

const CHAT_INSTRUCTIONS: &str = "You are a financial forecasting assistant. \
You help users create, refine, and explore financial models and forecasts.";

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A message as it is sent to the model service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// A fully bounded model request.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPrompt {
    pub instructions: String,
    /// History (oldest first) followed by the current request.
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub estimated_tokens: usize,
    /// History messages that did not fit.
    pub dropped_history: usize,
    /// SHA-256 over the instructions and messages, hex encoded.
    pub prompt_hash: String,
}

/// Shape of one pre-fetched input, described to the model.
#[derive(Debug, Clone)]
pub struct InputDescription {
    pub name: String,
    pub columns: Vec<String>,
    pub row_count: usize,
}

/// What the user asked for in a generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message: String,
    pub model_type: ModelType,
    /// Effective parameters after merging defaults, assumptions and overrides.
    pub parameters: Map<String, Value>,
    pub inputs: Vec<InputDescription>,
    /// Inline data pasted by the user, shown verbatim.
    pub historical_data: Option<Value>,
}

impl GenerationRequest {
    fn render(&self) -> String {
        let mut text = format!(
            "Generate a Python financial model for {}.\nDescription: {}\n",
            self.model_type, self.message
        );
        let params = serde_json::to_string_pretty(&self.parameters).unwrap_or_default();
        text.push_str("\nParameters (passed as `parameters`):\n");
        text.push_str(&params);
        text.push('\n');
        if !self.inputs.is_empty() {
            text.push_str("\nInputs (passed as `inputs`):\n");
            for input in &self.inputs {
                text.push_str(&format!(
                    "- {}: columns [{}], {} rows\n",
                    input.name,
                    input.columns.join(", "),
                    input.row_count
                ));
            }
        }
        if let Some(data) = &self.historical_data {
            text.push_str("\nHistorical data:\n");
            text.push_str(&serde_json::to_string(data).unwrap_or_default());
            text.push('\n');
        }
        text
    }
}

pub struct PromptCompiler {
    token_budget: usize,
    max_history_messages: usize,
    generation_max_tokens: u32,
    generation_temperature: f32,
    chat_max_tokens: u32,
    chat_temperature: f32,
}

impl PromptCompiler {
    pub fn new(prompt: &PromptSection, llm: &LlmSection) -> Self {
        Self {
            token_budget: prompt.token_budget,
            max_history_messages: prompt.max_history_messages,
            generation_max_tokens: llm.max_tokens,
            generation_temperature: llm.temperature,
            chat_max_tokens: llm.chat_max_tokens,
            chat_temperature: llm.chat_temperature,
        }
    }

    pub fn generation_instructions() -> String {
        GENERATION_INSTRUCTIONS.replace("{modules}", &ALLOWED_MODULES.join(", "))
    }

    /// Compile a code generation request.
    pub fn compile_generation(
        &self,
        history: &[Message],
        request: &GenerationRequest,
    ) -> Result<CompiledPrompt, PromptError> {
        self.compile(
            Self::generation_instructions(),
            history,
            request.render(),
            self.generation_max_tokens,
            self.generation_temperature,
        )
    }

    /// Compile a plain chat turn. Conversation context, if any, is appended
    /// to the instructions as JSON.
    pub fn compile_chat(
        &self,
        history: &[Message],
        message: &str,
        context: Option<&Value>,
    ) -> Result<CompiledPrompt, PromptError> {
        let mut instructions = CHAT_INSTRUCTIONS.to_string();
        if let Some(context) = context.filter(|c| !is_empty_json(c)) {
            instructions.push_str("\n\nContext: ");
            instructions.push_str(&serde_json::to_string(context).unwrap_or_default());
        }
        self.compile(
            instructions,
            history,
            message.to_string(),
            self.chat_max_tokens,
            self.chat_temperature,
        )
    }

    fn compile(
        &self,
        instructions: String,
        history: &[Message],
        request: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<CompiledPrompt, PromptError> {
        let required = estimate_tokens(&instructions) + estimate_tokens(&request);
        if required > self.token_budget {
            return Err(PromptError::TooLarge {
                required_tokens: required,
                budget: self.token_budget,
            });
        }

        let mut used = required;
        let mut kept: Vec<PromptMessage> = Vec::new();
        for message in history.iter().rev() {
            if kept.len() >= self.max_history_messages {
                break;
            }
            let cost = estimate_tokens(&message.text);
            if used + cost > self.token_budget {
                break;
            }
            used += cost;
            kept.push(PromptMessage {
                role: message.role,
                content: message.text.clone(),
            });
        }
        let dropped_history = history.len() - kept.len();
        kept.reverse();
        kept.push(PromptMessage {
            role: Role::User,
            content: request,
        });

        let prompt_hash = hash_prompt(&instructions, &kept);
        tracing::debug!(
            estimated_tokens = used,
            history_kept = kept.len() - 1,
            dropped_history,
            "Compiled prompt"
        );

        Ok(CompiledPrompt {
            instructions,
            messages: kept,
            max_tokens,
            temperature,
            estimated_tokens: used,
            dropped_history,
            prompt_hash,
        })
    }
}

fn is_empty_json(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn hash_prompt(instructions: &str, messages: &[PromptMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instructions.as_bytes());
    for message in messages {
        hasher.update(b"\n");
        hasher.update(message.role.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(message.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
