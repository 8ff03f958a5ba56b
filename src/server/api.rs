use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use modelsmith_common::{DataTable, ModelType};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::errors::{PipelineError, SessionError, StoreError};
use crate::pipeline::{
    ChatRequest, CreateModelRequest, DraftRequest, GenerateRequest, Pipeline, RequestContext,
    ReviseRequest, RunRequest,
};
use crate::store::import::parse_csv;
use crate::store::{DataSourceUpdate, ModelQuery, ModelUpdate};

/// Header carrying the authenticated owner id, set by the upstream gateway.
pub const OWNER_HEADER: &str = "x-owner-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub pipeline: Pipeline,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct GenerateQuery {
    pub model_type: Option<ModelType>,
}

#[derive(Deserialize)]
pub struct GenerateBody {
    pub message: String,
    pub model_type: Option<ModelType>,
    pub parameters: Option<Map<String, Value>>,
    pub name: Option<String>,
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub data_sources: Vec<i64>,
}

/// Metadata changes plus, when `code` or `parameters` is present, a new
/// executed version.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateModelRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
    pub code: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub base_version: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateDataSourceRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `{columns, rows}` or a list of records.
    pub data: Value,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateDataSourceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub data: Option<Value>,
}

/// Query for `POST /data-sources/import`; the body is CSV text.
#[derive(Deserialize)]
pub struct ImportQuery {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// ── Owner identity ────────────────────────────────────────────────────

/// Authenticated owner, taken from [`OWNER_HEADER`].
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

impl Owner {
    fn context(self) -> RequestContext {
        RequestContext::new(self.0)
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Pipeline(PipelineError),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Pipeline(err.into())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::Pipeline(err.into())
    }
}

/// HTTP status for a failure class.
pub fn status_for(kind: &str) -> StatusCode {
    match kind {
        "prompt_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
        "generation_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "generation_unavailable" | "sandbox_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "generation_parse" => StatusCode::BAD_GATEWAY,
        "execution_timeout" | "execution_policy_violation" | "execution_runtime" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "duplicate_name" | "version_conflict" => StatusCode::CONFLICT,
        "not_found" => StatusCode::NOT_FOUND,
        "forbidden" => StatusCode::FORBIDDEN,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "bad_request" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (kind, message) = match self {
            ApiError::Unauthorized => (
                "unauthorized",
                format!("missing {} header", OWNER_HEADER),
            ),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Pipeline(err) => {
                let kind = err.kind();
                if kind == "internal" {
                    tracing::error!(error = %err, "Internal error");
                    ("internal", "internal server error".to_string())
                } else {
                    (kind, err.to_string())
                }
            }
        };
        (
            status_for(kind),
            Json(json!({"error": {"kind": kind, "message": message}})),
        )
            .into_response()
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// Parse an optional JSON body; an empty body means the default.
fn optional_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    let v1 = Router::new()
        .route("/health", get(health_check))
        .route("/chat/message", post(chat_message))
        .route("/chat/conversations/{id}", get(get_conversation))
        .route("/chat/generate-forecast", post(generate_forecast))
        .route("/models", get(list_models).post(create_model))
        .route("/models/generate", post(generate_model))
        .route(
            "/models/{id}",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/models/{id}/run", post(run_model))
        .route("/models/{id}/revise", post(revise_model))
        .route("/models/{id}/versions", get(list_versions))
        .route("/models/{id}/versions/{seq}", get(get_version))
        .route("/data-sources", get(list_data_sources).post(create_data_source))
        .route("/data-sources/preview", post(preview_csv))
        .route("/data-sources/import", post(import_csv))
        .route(
            "/data-sources/{id}",
            get(get_data_source)
                .put(update_data_source)
                .delete(delete_data_source),
        )
        .route("/ws", get(super::ws::ws_handler));
    Router::new().nest("/api/v1", v1)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

async fn chat_message(
    State(state): State<SharedState>,
    owner: Owner,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let reply = state.pipeline.chat(&owner.context(), request).await?;
    Ok(Json(reply))
}

async fn get_conversation(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.pipeline.sessions().history(id, &owner.0).await?;
    Ok(Json(snapshot))
}

async fn generate_forecast(
    State(state): State<SharedState>,
    owner: Owner,
    payload: Result<Json<DraftRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let draft = state.pipeline.draft(&owner.context(), request).await?;
    Ok(Json(draft))
}

async fn generate_model(
    State(state): State<SharedState>,
    owner: Owner,
    Query(query): Query<GenerateQuery>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    let model_type = query
        .model_type
        .or(req.model_type)
        .ok_or_else(|| ApiError::BadRequest("model_type is required".to_string()))?;
    let generated = state
        .pipeline
        .generate(
            &owner.context(),
            GenerateRequest {
                message: req.message,
                model_type,
                parameters: req.parameters,
                name: req.name,
                conversation_id: req.conversation_id,
                data_sources: req.data_sources,
            },
        )
        .await?;
    let status = if generated.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(generated)))
}

async fn list_models(
    State(state): State<SharedState>,
    owner: Owner,
    Query(query): Query<ModelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let models = state
        .pipeline
        .store()
        .call(move |db| db.list_models(&owner.0, &query))
        .await?;
    Ok(Json(models))
}

async fn create_model(
    State(state): State<SharedState>,
    owner: Owner,
    payload: Result<Json<CreateModelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let created = state
        .pipeline
        .create_model(&owner.context(), request)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_model(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let model = state
        .pipeline
        .store()
        .call(move |db| db.get_model(&owner.0, id))
        .await?;
    Ok(Json(model))
}

async fn update_model(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
    payload: Result<Json<UpdateModelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("model name is empty".to_string()));
    }
    let ctx = owner.context();
    if req.code.is_some() || req.parameters.is_some() {
        state
            .pipeline
            .revise(
                &ctx,
                id,
                ReviseRequest {
                    code: req.code,
                    parameters: req.parameters,
                    base_version: req.base_version,
                    ..Default::default()
                },
            )
            .await?;
    }
    let update = ModelUpdate {
        name: req.name,
        description: req.description,
        is_public: req.is_public,
    };
    let model = state
        .pipeline
        .store()
        .call(move |db| db.update_model(&ctx.owner, id, &update))
        .await?;
    Ok(Json(model))
}

async fn delete_model(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .pipeline
        .store()
        .call(move |db| db.delete_model(&owner.0, id))
        .await?;
    Ok(Json(json!({"id": id, "outcome": outcome})))
}

async fn run_model(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: RunRequest = optional_body(&bytes)?;
    let result = state
        .pipeline
        .run_model(&owner.context(), id, request)
        .await?;
    Ok(Json(result))
}

async fn revise_model(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
    payload: Result<Json<ReviseRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let version = state.pipeline.revise(&owner.context(), id, request).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn list_versions(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state
        .pipeline
        .store()
        .call(move |db| db.list_versions(&owner.0, id))
        .await?;
    Ok(Json(versions))
}

async fn get_version(
    State(state): State<SharedState>,
    owner: Owner,
    Path((id, seq)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state
        .pipeline
        .store()
        .call(move |db| db.get_version(&owner.0, id, seq))
        .await?;
    Ok(Json(version))
}

async fn list_data_sources(
    State(state): State<SharedState>,
    owner: Owner,
) -> Result<impl IntoResponse, ApiError> {
    let sources = state
        .pipeline
        .store()
        .call(move |db| db.list_data_sources(&owner.0))
        .await?;
    Ok(Json(sources))
}

async fn create_data_source(
    State(state): State<SharedState>,
    owner: Owner,
    payload: Result<Json<CreateDataSourceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("data source name is empty".to_string()));
    }
    let table = DataTable::from_json(&req.data).map_err(ApiError::BadRequest)?;
    let source = state
        .pipeline
        .store()
        .call(move |db| db.create_data_source(&owner.0, req.name.trim(), &req.description, &table))
        .await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn get_data_source(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let source = state
        .pipeline
        .store()
        .call(move |db| db.get_data_source(&owner.0, id))
        .await?;
    Ok(Json(source))
}

async fn update_data_source(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
    payload: Result<Json<UpdateDataSourceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    let name = req.name.map(|n| n.trim().to_string());
    if name.as_deref().is_some_and(str::is_empty) {
        return Err(ApiError::BadRequest("data source name is empty".to_string()));
    }
    let table = req
        .data
        .as_ref()
        .map(DataTable::from_json)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let update = DataSourceUpdate {
        name,
        description: req.description,
        table,
    };
    let source = state
        .pipeline
        .store()
        .call(move |db| db.update_data_source(&owner.0, id, &update))
        .await?;
    Ok(Json(source))
}

/// Typed first rows and detected schema of an uploaded CSV. Nothing is stored.
async fn preview_csv(_owner: Owner, text: String) -> Result<impl IntoResponse, ApiError> {
    let import = parse_csv(&text).map_err(ApiError::BadRequest)?;
    Ok(Json(import.preview()))
}

async fn import_csv(
    State(state): State<SharedState>,
    owner: Owner,
    Query(query): Query<ImportQuery>,
    text: String,
) -> Result<impl IntoResponse, ApiError> {
    let name = query.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("data source name is empty".to_string()));
    }
    let import = parse_csv(&text).map_err(ApiError::BadRequest)?;
    let schema = import.schema;
    let table = import.table;
    let source = state
        .pipeline
        .store()
        .call(move |db| db.create_data_source(&owner.0, &name, &query.description, &table))
        .await?;
    tracing::info!(source_id = source.id, rows = source.table.rows.len(), "Imported CSV data source");
    Ok((
        StatusCode::CREATED,
        Json(json!({"source": source, "schema": schema})),
    ))
}

async fn delete_data_source(
    State(state): State<SharedState>,
    owner: Owner,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .pipeline
        .store()
        .call(move |db| db.delete_data_source(&owner.0, id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
