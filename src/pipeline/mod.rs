//! Request pipeline.
//!
//! Every request moves through `Received → Compiling → Generating →
//! Executing → {Committed | Rejected}`. Each transition is logged and
//! broadcast as a [`WsMessage`]. Only `Committed` writes to the model store;
//! a rejection leaves stored models untouched and is recorded in the
//! conversation as a system message.
//!
//! State is passed explicitly through [`RequestContext`]. The pipeline holds
//! only shared services.

pub mod events;

pub use events::{EventSender, OwnedEvent, Stage, WsMessage, broadcast_message};

use std::collections::BTreeMap;
use std::sync::Arc;

use modelsmith_common::{DataTable, ExecutionResult, Message, ModelType, Provenance};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{PipelineError, StoreError};
use crate::llm::GenerationClient;
use crate::prompt::defaults::effective_parameters;
use crate::prompt::{GenerationRequest, InputDescription, PromptCompiler};
use crate::sandbox::{ExecutionJob, Executor, rejection};
use crate::session::SessionManager;
use crate::store::{
    DbHandle, InputRef, Model, NewModel, NewVersion, SeriesSource, Version,
};

/// Identity and correlation id of one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub owner: String,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            request_id: Uuid::new_v4(),
        }
    }
}

// ── Requests and replies ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: Option<Uuid>,
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub conversation_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftRequest {
    pub message: String,
    pub model_type: ModelType,
    pub historical_data: Option<Value>,
    pub assumptions: Option<Map<String, Value>>,
    pub conversation_id: Option<Uuid>,
}

/// Generated but never executed code.
#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub model_type: ModelType,
    pub code: String,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub message: String,
    pub model_type: ModelType,
    pub parameters: Option<Map<String, Value>>,
    pub name: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub data_sources: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Generated {
    pub model: Model,
    pub version: Version,
    /// Whether the model was created by this request.
    pub created: bool,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub version: Option<i64>,
    pub parameters: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviseRequest {
    /// Replacement code, used as is.
    pub code: Option<String>,
    /// Change request for the model service when no code is given.
    pub message: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    /// Version the revision is based on; the commit fails if the model has
    /// moved past it.
    pub base_version: Option<i64>,
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateModelRequest {
    pub name: String,
    pub model_type: ModelType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    pub code: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub data_sources: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Created {
    pub model: Model,
    pub version: Option<Version>,
}

/// Pre-fetched execution inputs.
#[derive(Default)]
struct Inputs {
    tables: BTreeMap<String, Arc<DataTable>>,
    refs: Vec<InputRef>,
    descriptions: Vec<InputDescription>,
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

fn default_model_name(message: &str, model_type: ModelType) -> String {
    match slugify(message, 48) {
        slug if slug.is_empty() => format!("{}-model", model_type),
        slug => slug,
    }
}

fn overlay(mut base: Map<String, Value>, overrides: Option<Map<String, Value>>) -> Map<String, Value> {
    if let Some(overrides) = overrides {
        base.extend(overrides);
    }
    base
}

pub struct Pipeline {
    compiler: PromptCompiler,
    generator: GenerationClient,
    executor: Arc<dyn Executor>,
    store: DbHandle,
    sources: Arc<dyn SeriesSource>,
    sessions: Arc<SessionManager>,
    events: EventSender,
}

impl Pipeline {
    pub fn new(
        compiler: PromptCompiler,
        generator: GenerationClient,
        executor: Arc<dyn Executor>,
        store: DbHandle,
        sessions: Arc<SessionManager>,
        events: EventSender,
    ) -> Self {
        let sources: Arc<dyn SeriesSource> = Arc::new(store.clone());
        Self {
            compiler,
            generator,
            executor,
            store,
            sources,
            sessions,
            events,
        }
    }

    pub fn store(&self) -> &DbHandle {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    fn stage(&self, ctx: &RequestContext, stage: Stage, model_id: Option<i64>) {
        tracing::info!(
            request_id = %ctx.request_id,
            owner = %ctx.owner,
            stage = stage.as_str(),
            model_id = ?model_id,
            "Pipeline stage"
        );
        broadcast_message(
            &self.events,
            &ctx.owner,
            &WsMessage::StageChanged {
                request_id: ctx.request_id,
                stage,
                model_id,
            },
        );
    }

    fn committed(&self, ctx: &RequestContext, version: &Version) {
        self.stage(ctx, Stage::Committed, Some(version.model_id));
        broadcast_message(
            &self.events,
            &ctx.owner,
            &WsMessage::VersionCommitted {
                request_id: ctx.request_id,
                model_id: version.model_id,
                seq: version.seq,
            },
        );
    }

    fn rejected(&self, ctx: &RequestContext, err: &PipelineError) {
        tracing::warn!(
            request_id = %ctx.request_id,
            owner = %ctx.owner,
            kind = err.kind(),
            error = %err,
            "Request rejected"
        );
        broadcast_message(
            &self.events,
            &ctx.owner,
            &WsMessage::StageChanged {
                request_id: ctx.request_id,
                stage: Stage::Rejected,
                model_id: None,
            },
        );
        broadcast_message(
            &self.events,
            &ctx.owner,
            &WsMessage::RequestRejected {
                request_id: ctx.request_id,
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        );
    }

    /// Record a failure in the conversation. The request has already
    /// failed, so an append error is only logged.
    async fn record_failure(&self, ctx: &RequestContext, conversation_id: Uuid, err: &PipelineError) {
        self.rejected(ctx, err);
        let note = Message::system(format!("Error: {}", err));
        if let Err(e) = self
            .sessions
            .append(conversation_id, &ctx.owner, note)
            .await
        {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to record error");
        }
    }

    async fn fetch_inputs(&self, owner: &str, source_ids: &[i64]) -> Result<Inputs, PipelineError> {
        let mut inputs = Inputs::default();
        for &id in source_ids {
            let source = self.sources.fetch_series(owner, id).await?;
            if inputs.tables.contains_key(&source.name) {
                return Err(PipelineError::BadRequest(format!(
                    "two inputs are named '{}'",
                    source.name
                )));
            }
            inputs.descriptions.push(InputDescription {
                name: source.name.clone(),
                columns: source.table.columns.clone(),
                row_count: source.table.rows.len(),
            });
            inputs.refs.push(InputRef {
                name: source.name.clone(),
                source_id: id,
            });
            inputs.tables.insert(source.name, Arc::new(source.table));
        }
        Ok(inputs)
    }

    /// Execute and turn any non-success classification into an error.
    async fn execute_checked(&self, job: &ExecutionJob) -> Result<ExecutionResult, PipelineError> {
        let result = self.executor.execute(job).await?;
        match rejection(&result, self.executor.limits()) {
            Some(err) => Err(err.into()),
            None => Ok(result),
        }
    }

    async fn owned_model(&self, owner: &str, model_id: i64) -> Result<Model, PipelineError> {
        let reader = owner.to_string();
        let model = self
            .store
            .call(move |db| db.get_model(&reader, model_id))
            .await?;
        if model.owner != owner {
            return Err(StoreError::Forbidden.into());
        }
        Ok(model)
    }

    // ── Chat ──────────────────────────────────────────────────────────

    /// One conversational turn. Nothing is executed or stored.
    pub async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> Result<ChatReply, PipelineError> {
        let conversation_id = self.sessions.open(&ctx.owner, request.conversation_id)?;
        if let Some(context) = request.context {
            self.sessions
                .set_context(conversation_id, &ctx.owner, context)
                .await?;
        }
        let snapshot = self.sessions.history(conversation_id, &ctx.owner).await?;
        self.sessions
            .append(conversation_id, &ctx.owner, Message::user(&request.message))
            .await?;

        let reply = async {
            let prompt = self.compiler.compile_chat(
                &snapshot.messages,
                &request.message,
                snapshot.context.as_ref(),
            )?;
            Ok::<_, PipelineError>(self.generator.complete_text(&prompt).await?)
        }
        .await;

        match reply {
            Ok(text) => {
                self.sessions
                    .append(conversation_id, &ctx.owner, Message::assistant(&text))
                    .await?;
                broadcast_message(
                    &self.events,
                    &ctx.owner,
                    &WsMessage::ChatReplied {
                        request_id: ctx.request_id,
                        conversation_id,
                    },
                );
                Ok(ChatReply {
                    conversation_id,
                    message: text,
                })
            }
            Err(e) => {
                self.record_failure(ctx, conversation_id, &e).await;
                Err(e)
            }
        }
    }

    // ── Draft ─────────────────────────────────────────────────────────

    /// Compile and generate only. The code is returned for review.
    pub async fn draft(
        &self,
        ctx: &RequestContext,
        request: DraftRequest,
    ) -> Result<Draft, PipelineError> {
        self.stage(ctx, Stage::Received, None);
        let history = match request.conversation_id {
            Some(id) => {
                let id = self.sessions.open(&ctx.owner, Some(id))?;
                self.sessions.history(id, &ctx.owner).await?.messages
            }
            None => Vec::new(),
        };

        let outcome = async {
            self.stage(ctx, Stage::Compiling, None);
            let parameters = effective_parameters(request.model_type, request.assumptions.iter());
            let prompt = self.compiler.compile_generation(
                &history,
                &GenerationRequest {
                    message: request.message.clone(),
                    model_type: request.model_type,
                    parameters: parameters.clone(),
                    inputs: Vec::new(),
                    historical_data: request.historical_data.clone(),
                },
            )?;
            self.stage(ctx, Stage::Generating, None);
            let generated = self.generator.generate_code(&prompt).await?;
            Ok::<_, PipelineError>(Draft {
                model_type: request.model_type,
                code: generated.code,
                parameters,
            })
        }
        .await;

        outcome.inspect_err(|e| self.rejected(ctx, e))
    }

    // ── Generate ──────────────────────────────────────────────────────

    /// Full generation: compile, generate, execute, and commit on success.
    pub async fn generate(
        &self,
        ctx: &RequestContext,
        request: GenerateRequest,
    ) -> Result<Generated, PipelineError> {
        self.stage(ctx, Stage::Received, None);
        let conversation_id = self.sessions.open(&ctx.owner, request.conversation_id)?;
        let snapshot = self.sessions.history(conversation_id, &ctx.owner).await?;
        self.sessions
            .append(conversation_id, &ctx.owner, Message::user(&request.message))
            .await?;

        match self
            .generate_committed(ctx, conversation_id, &snapshot.messages, request)
            .await
        {
            Ok(generated) => {
                let note = format!(
                    "Committed version {} of model '{}'.",
                    generated.version.seq, generated.model.name
                );
                self.sessions
                    .append(conversation_id, &ctx.owner, Message::assistant(note))
                    .await?;
                Ok(generated)
            }
            Err(e) => {
                self.record_failure(ctx, conversation_id, &e).await;
                Err(e)
            }
        }
    }

    async fn generate_committed(
        &self,
        ctx: &RequestContext,
        conversation_id: Uuid,
        history: &[Message],
        request: GenerateRequest,
    ) -> Result<Generated, PipelineError> {
        let inputs = self.fetch_inputs(&ctx.owner, &request.data_sources).await?;

        self.stage(ctx, Stage::Compiling, None);
        let parameters = effective_parameters(request.model_type, request.parameters.iter());
        let prompt = self.compiler.compile_generation(
            history,
            &GenerationRequest {
                message: request.message.clone(),
                model_type: request.model_type,
                parameters: parameters.clone(),
                inputs: inputs.descriptions,
                historical_data: None,
            },
        )?;

        self.stage(ctx, Stage::Generating, None);
        let generated = self.generator.generate_code(&prompt).await?;

        self.stage(ctx, Stage::Executing, None);
        let result = self
            .execute_checked(&ExecutionJob {
                code: generated.code.clone(),
                parameters: parameters.clone(),
                inputs: inputs.tables,
            })
            .await?;

        let model = NewModel {
            owner: ctx.owner.clone(),
            name: request
                .name
                .clone()
                .unwrap_or_else(|| default_model_name(&request.message, request.model_type)),
            model_type: request.model_type,
            description: request.message.clone(),
            is_public: false,
        };
        let version = NewVersion {
            code: generated.code,
            parameters,
            inputs: inputs.refs,
            result,
            provenance: Provenance {
                conversation_id: Some(conversation_id),
                prompt_hash: prompt.prompt_hash,
            },
            expected_current: None,
        };
        let (model, version, created) = self
            .store
            .call(move |db| db.commit_generation(&model, &version))
            .await?;
        self.committed(ctx, &version);

        Ok(Generated {
            model,
            version,
            created,
            conversation_id,
        })
    }

    // ── Run ───────────────────────────────────────────────────────────

    /// Execute a stored version with parameter overrides. Never commits.
    pub async fn run_model(
        &self,
        ctx: &RequestContext,
        model_id: i64,
        request: RunRequest,
    ) -> Result<ExecutionResult, PipelineError> {
        self.stage(ctx, Stage::Received, Some(model_id));
        let owner = ctx.owner.clone();
        let model = self
            .store
            .call(move |db| db.get_model(&owner, model_id))
            .await?;
        let seq = request
            .version
            .or(model.current_version)
            .ok_or_else(|| PipelineError::BadRequest(format!("model {} has no versions", model_id)))?;
        let owner = ctx.owner.clone();
        let version = self
            .store
            .call(move |db| db.get_version(&owner, model_id, seq))
            .await?;

        let source_ids: Vec<i64> = version.inputs.iter().map(|i| i.source_id).collect();
        // Data sources stay private even when the model is public.
        if !source_ids.is_empty() && model.owner != ctx.owner {
            return Err(StoreError::Forbidden.into());
        }
        let inputs = self.fetch_inputs(&ctx.owner, &source_ids).await?;

        self.stage(ctx, Stage::Executing, Some(model_id));
        let result = self
            .executor
            .execute(&ExecutionJob {
                code: version.code,
                parameters: overlay(version.parameters, request.parameters),
                inputs: inputs.tables,
            })
            .await?;
        tracing::info!(
            request_id = %ctx.request_id,
            model_id,
            seq,
            status = %result.status,
            "Ran stored version"
        );
        Ok(result)
    }

    // ── Revise ────────────────────────────────────────────────────────

    /// Commit a corrected version. History is never edited; every
    /// revision is a new version.
    pub async fn revise(
        &self,
        ctx: &RequestContext,
        model_id: i64,
        request: ReviseRequest,
    ) -> Result<Version, PipelineError> {
        self.stage(ctx, Stage::Received, Some(model_id));
        let conversation_id = request.conversation_id;
        let outcome = self.revise_committed(ctx, model_id, request).await;
        if let Err(e) = &outcome {
            match conversation_id {
                Some(id) if self.sessions.open(&ctx.owner, Some(id)).is_ok() => {
                    self.record_failure(ctx, id, e).await;
                }
                _ => self.rejected(ctx, e),
            }
        }
        outcome
    }

    async fn revise_committed(
        &self,
        ctx: &RequestContext,
        model_id: i64,
        request: ReviseRequest,
    ) -> Result<Version, PipelineError> {
        if request.code.is_none() && request.message.is_none() && request.parameters.is_none() {
            return Err(PipelineError::BadRequest(
                "a revision needs code, a message or parameters".to_string(),
            ));
        }

        let model = self.owned_model(&ctx.owner, model_id).await?;
        let base_seq = request.base_version.or(model.current_version);
        let base = match base_seq {
            Some(seq) => {
                let owner = ctx.owner.clone();
                Some(
                    self.store
                        .call(move |db| db.get_version(&owner, model_id, seq))
                        .await?,
                )
            }
            None => None,
        };

        let base_parameters = match &base {
            Some(version) => version.parameters.clone(),
            None => effective_parameters(model.model_type, std::iter::empty()),
        };
        let parameters = overlay(base_parameters, request.parameters);
        let source_ids: Vec<i64> = base
            .as_ref()
            .map(|v| v.inputs.iter().map(|i| i.source_id).collect())
            .unwrap_or_default();
        let inputs = self.fetch_inputs(&ctx.owner, &source_ids).await?;

        let (code, prompt_hash) = match (request.code, request.message) {
            (Some(code), _) => (code, String::new()),
            (None, Some(message)) => {
                self.stage(ctx, Stage::Compiling, Some(model_id));
                let mut history = match request.conversation_id {
                    Some(id) => {
                        let id = self.sessions.open(&ctx.owner, Some(id))?;
                        self.sessions.history(id, &ctx.owner).await?.messages
                    }
                    None => Vec::new(),
                };
                if let Some(version) = &base {
                    history.push(Message::assistant(format!(
                        "Current model code:\n```python\n{}\n```",
                        version.code
                    )));
                }
                let prompt = self.compiler.compile_generation(
                    &history,
                    &GenerationRequest {
                        message,
                        model_type: model.model_type,
                        parameters: parameters.clone(),
                        inputs: inputs.descriptions,
                        historical_data: None,
                    },
                )?;
                self.stage(ctx, Stage::Generating, Some(model_id));
                let generated = self.generator.generate_code(&prompt).await?;
                (generated.code, prompt.prompt_hash)
            }
            (None, None) => match &base {
                Some(version) => (version.code.clone(), version.provenance.prompt_hash.clone()),
                None => {
                    return Err(PipelineError::BadRequest(format!(
                        "model {} has no code to re-run",
                        model_id
                    )));
                }
            },
        };

        self.stage(ctx, Stage::Executing, Some(model_id));
        let result = self
            .execute_checked(&ExecutionJob {
                code: code.clone(),
                parameters: parameters.clone(),
                inputs: inputs.tables,
            })
            .await?;

        let new = NewVersion {
            code,
            parameters,
            inputs: inputs.refs,
            result,
            provenance: Provenance {
                conversation_id: request.conversation_id,
                prompt_hash,
            },
            expected_current: request.base_version,
        };
        let owner = ctx.owner.clone();
        let version = self
            .store
            .call(move |db| db.commit_version(&owner, model_id, &new))
            .await?;
        self.committed(ctx, &version);
        Ok(version)
    }

    // ── Create ────────────────────────────────────────────────────────

    /// Explicit creation. Initial code, if any, must execute successfully
    /// and becomes version 1 in the same step.
    pub async fn create_model(
        &self,
        ctx: &RequestContext,
        request: CreateModelRequest,
    ) -> Result<Created, PipelineError> {
        self.stage(ctx, Stage::Received, None);
        let outcome = self.create_committed(ctx, request).await;
        outcome.inspect_err(|e| self.rejected(ctx, e))
    }

    async fn create_committed(
        &self,
        ctx: &RequestContext,
        request: CreateModelRequest,
    ) -> Result<Created, PipelineError> {
        if request.name.trim().is_empty() {
            return Err(PipelineError::BadRequest("model name is empty".to_string()));
        }
        let model = NewModel {
            owner: ctx.owner.clone(),
            name: request.name.trim().to_string(),
            model_type: request.model_type,
            description: request.description,
            is_public: request.is_public,
        };

        let Some(code) = request.code else {
            let created = self.store.call(move |db| db.create_model(&model)).await?;
            return Ok(Created {
                model: created,
                version: None,
            });
        };

        let inputs = self.fetch_inputs(&ctx.owner, &request.data_sources).await?;
        let parameters = effective_parameters(request.model_type, request.parameters.iter());
        self.stage(ctx, Stage::Executing, None);
        let result = self
            .execute_checked(&ExecutionJob {
                code: code.clone(),
                parameters: parameters.clone(),
                inputs: inputs.tables,
            })
            .await?;

        let new = NewVersion {
            code,
            parameters,
            inputs: inputs.refs,
            result,
            provenance: Provenance::default(),
            expected_current: Some(0),
        };
        let (model, version) = self
            .store
            .call(move |db| db.create_model_with_version(&model, &new))
            .await?;
        self.committed(ctx, &version);
        Ok(Created {
            model,
            version: Some(version),
        })
    }
}
