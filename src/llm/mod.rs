//! Code generation client.
//!
//! `CompletionService` is the transport seam (OpenAI-compatible HTTP in
//! production, scripted fakes in tests). `GenerationClient` adds the
//! per-attempt timeout, bounded retries with capped exponential backoff,
//! and reduction of the reply to a single code artifact.

pub mod extract;
pub mod openai;

pub use extract::extract_code_block;
pub use openai::OpenAiCompletionService;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::LlmSection;
use crate::errors::GenerationError;
use crate::prompt::{CODE_LANGUAGE, CompiledPrompt, PromptMessage};

/// Classified transport failure of a single attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// Worth retrying: connect errors, rate limiting, 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not worth retrying: other 4xx, malformed responses, missing credentials.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub instructions: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&CompiledPrompt> for CompletionRequest {
    fn from(prompt: &CompiledPrompt) -> Self {
        Self {
            instructions: prompt.instructions.clone(),
            messages: prompt.messages.clone(),
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmSection) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Code extracted from a successful generation, with the raw reply kept
/// for logging.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub code: String,
    pub raw: String,
}

#[derive(Clone)]
pub struct GenerationClient {
    service: Arc<dyn CompletionService>,
    policy: RetryPolicy,
}

impl GenerationClient {
    pub fn new(service: Arc<dyn CompletionService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Plain text completion (chat turns).
    pub async fn complete_text(&self, prompt: &CompiledPrompt) -> Result<String, GenerationError> {
        self.complete_with_retry(&CompletionRequest::from(prompt))
            .await
    }

    /// Completion reduced to exactly one code block.
    pub async fn generate_code(
        &self,
        prompt: &CompiledPrompt,
    ) -> Result<GeneratedCode, GenerationError> {
        let raw = self
            .complete_with_retry(&CompletionRequest::from(prompt))
            .await?;
        let code = extract_code_block(&raw, CODE_LANGUAGE).inspect_err(|e| {
            tracing::warn!(error = %e, reply_len = raw.len(), "Model reply had no usable code");
        })?;
        Ok(GeneratedCode { code, raw })
    }

    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<String, GenerationError> {
        let max_attempts = self.policy.max_retries + 1;
        let mut last_error = TransportError::Timeout;

        for attempt in 1..=max_attempts {
            let outcome =
                match tokio::time::timeout(self.policy.request_timeout, self.service.complete(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };

            match outcome {
                Ok(text) => {
                    tracing::debug!(
                        service = self.service.name(),
                        attempt,
                        reply_len = text.len(),
                        "Completion succeeded"
                    );
                    return Ok(text);
                }
                Err(TransportError::Fatal(reason)) => {
                    tracing::warn!(service = self.service.name(), attempt, %reason, "Completion failed");
                    return Err(GenerationError::Unavailable {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        service = self.service.name(),
                        attempt,
                        max_attempts,
                        error = %err,
                        "Completion attempt failed"
                    );
                    last_error = err;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
                    }
                }
            }
        }

        Err(match last_error {
            TransportError::Timeout => GenerationError::Timeout {
                attempts: max_attempts,
            },
            TransportError::Transient(reason) | TransportError::Fatal(reason) => {
                GenerationError::Unavailable {
                    attempts: max_attempts,
                    reason,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCompletionService;
    use modelsmith_common::Role;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            request_timeout: Duration::from_millis(200),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn prompt() -> CompiledPrompt {
        CompiledPrompt {
            instructions: "instructions".into(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: "forecast".into(),
            }],
            max_tokens: 100,
            temperature: 0.2,
            estimated_tokens: 5,
            dropped_history: 0,
            prompt_hash: "h".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            request_timeout: Duration::from_secs(1),
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(p.backoff(0), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_millis(3000));
        assert_eq!(p.backoff(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(TransportError::Transient("503".into())),
            Ok("```python\nx = 1\n```".into()),
        ]));
        let client = GenerationClient::new(service.clone(), policy(3));
        let generated = client.generate_code(&prompt()).await.unwrap();
        assert_eq!(generated.code, "x = 1");
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_timeouts() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
        ]));
        let client = GenerationClient::new(service.clone(), policy(2));
        let err = client.complete_text(&prompt()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout { attempts: 3 }));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_service_hits_request_timeout() {
        let service = Arc::new(
            ScriptedCompletionService::new(vec![Ok("late".into())])
                .with_delay(Duration::from_secs(5)),
        );
        let client = GenerationClient::new(service, policy(0));
        let err = client.complete_text(&prompt()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_exhausted_transient_is_unavailable() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(TransportError::Transient("429".into())),
            Err(TransportError::Transient("429".into())),
        ]));
        let client = GenerationClient::new(service, policy(1));
        match client.complete_text(&prompt()).await.unwrap_err() {
            GenerationError::Unavailable { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, "429");
            }
            other => panic!("Expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(TransportError::Fatal("401 bad key".into())),
            Ok("never".into()),
        ]));
        let client = GenerationClient::new(service.clone(), policy(3));
        let err = client.complete_text(&prompt()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable { attempts: 1, .. }));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_not_retried() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Ok("no code here".into()),
            Ok("```python\nx = 1\n```".into()),
        ]));
        let client = GenerationClient::new(service.clone(), policy(3));
        let err = client.generate_code(&prompt()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Parse { .. }));
        assert_eq!(service.calls(), 1);
    }
}
