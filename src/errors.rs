//! Typed error hierarchy for modelsmith.
//!
//! One enum per subsystem:
//! - `PromptError`: prompt compilation
//! - `GenerationError`: LLM transport and code extraction
//! - `ExecutionError`: sandbox outcomes that abort a request
//! - `StoreError`: model/version/data source persistence
//! - `SessionError`: conversation ownership and lookup
//!
//! `PipelineError` wraps all of them and maps each to a stable `kind()`
//! string used on the HTTP surface.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the prompt compiler.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error(
        "Prompt requires {required_tokens} tokens before history, budget is {budget}"
    )]
    TooLarge { required_tokens: usize, budget: usize },
}

/// Errors from the code generation client.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Model service timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Model service unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("Could not extract code from model response: {reason}")]
    Parse { reason: String },
}

/// Errors from the sandboxed executor.
///
/// `Unavailable` is an infrastructure failure (no interpreter, no Docker
/// daemon). The other variants are raised by the pipeline when a classified
/// execution result is not a success.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Execution exceeded the {limit_ms}ms limit")]
    Timeout { limit_ms: u64 },

    #[error("Execution policy violation: {detail}")]
    PolicyViolation { detail: String },

    #[error("Generated code failed at runtime: {detail}")]
    Runtime { detail: String },

    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the model version store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Owner already has a model named '{name}'")]
    DuplicateName { name: String },

    #[error("Model {model_id} is at version {actual}, expected {expected}")]
    VersionConflict {
        model_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("Model {id} not found")]
    ModelNotFound { id: i64 },

    #[error("Version {seq} of model {model_id} not found")]
    VersionNotFound { model_id: i64, seq: i64 },

    #[error("Data source {id} not found")]
    DataSourceNotFound { id: i64 },

    #[error("Not enough permissions")]
    Forbidden,

    #[error("Only successful executions can be committed (got {status})")]
    NotCommittable { status: String },

    #[error("Invalid stored value: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task failed: {0}")]
    TaskFailed(String),
}

/// Errors from the conversation session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Conversation {id} not found")]
    NotFound { id: Uuid },

    #[error("Conversation {id} belongs to another owner")]
    Forbidden { id: Uuid },
}

/// Any failure of a pipeline request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stable machine-readable failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prompt(PromptError::TooLarge { .. }) => "prompt_too_large",
            Self::Generation(GenerationError::Timeout { .. }) => "generation_timeout",
            Self::Generation(GenerationError::Unavailable { .. }) => "generation_unavailable",
            Self::Generation(GenerationError::Parse { .. }) => "generation_parse",
            Self::Execution(ExecutionError::Timeout { .. }) => "execution_timeout",
            Self::Execution(ExecutionError::PolicyViolation { .. }) => {
                "execution_policy_violation"
            }
            Self::Execution(ExecutionError::Runtime { .. }) => "execution_runtime",
            Self::Execution(ExecutionError::Unavailable(_)) => "sandbox_unavailable",
            Self::Store(StoreError::DuplicateName { .. }) => "duplicate_name",
            Self::Store(StoreError::VersionConflict { .. }) => "version_conflict",
            Self::Store(StoreError::ModelNotFound { .. })
            | Self::Store(StoreError::VersionNotFound { .. })
            | Self::Store(StoreError::DataSourceNotFound { .. })
            | Self::Session(SessionError::NotFound { .. }) => "not_found",
            Self::Store(StoreError::Forbidden) | Self::Session(SessionError::Forbidden { .. }) => {
                "forbidden"
            }
            Self::Store(StoreError::NotCommittable { .. }) | Self::BadRequest(_) => "bad_request",
            Self::Store(_) | Self::Other(_) => "internal",
        }
    }
}
