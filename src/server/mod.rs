//! HTTP and WebSocket surface.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::{AppConfig, ServerSection};
use crate::llm::{GenerationClient, OpenAiCompletionService, RetryPolicy};
use crate::pipeline::{OwnedEvent, Pipeline};
use crate::prompt::PromptCompiler;
use crate::sandbox::SandboxExecutor;
use crate::session::SessionManager;
use crate::store::{DbHandle, ModelDb};

pub use api::{AppState, SharedState};

/// Build the full application router: REST API, event socket and a bare
/// liveness check.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

fn cors_layer(server: &ServerSection) -> CorsLayer {
    if server.dev_mode {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Assemble the pipeline from configuration.
pub fn build_state(config: &AppConfig) -> Result<SharedState> {
    if let Some(parent) = config.store.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ModelDb::new(&config.store.db_path).context("Failed to initialize model database")?;

    if config.llm.api_key.is_none() {
        tracing::warn!("No LLM API key configured; generation requests will fail");
    }
    let service = OpenAiCompletionService::from_config(&config.llm);
    let generator = GenerationClient::new(Arc::new(service), RetryPolicy::from_config(&config.llm));
    let executor =
        SandboxExecutor::from_config(&config.sandbox).context("Failed to initialize sandbox")?;
    let (events, _rx) = broadcast::channel::<OwnedEvent>(256);

    let pipeline = Pipeline::new(
        PromptCompiler::new(&config.prompt, &config.llm),
        generator,
        Arc::new(executor),
        DbHandle::new(db),
        Arc::new(SessionManager::from_config(&config.sessions)),
        events,
    );
    Ok(Arc::new(AppState { pipeline }))
}

/// Run the server until Ctrl+C.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = build_state(&config)?;
    let app = build_router(state).layer(cors_layer(&config.server));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        backend = ?config.sandbox.backend,
        db = %config.store.db_path.display(),
        "modelsmith listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C; shutting down");
        return;
    }
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxBackendKind;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.db_path = dir.path().join("nested").join("models.db");
        config.sandbox.backend = SandboxBackendKind::Process;
        config.sandbox.interpreter = vec!["sh".into(), "-s".into()];
        let state = build_state(&config).unwrap();
        (build_router(state), dir)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/api/v1/models")
            .header(api::OWNER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/api/v2/models")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_build_state_creates_database_directory() {
        let (_app, dir) = test_router();
        assert!(dir.path().join("nested").join("models.db").exists());
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let (app, _dir) = test_router();
        let app = app.layer(cors_layer(&ServerSection::default()));
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/models")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }
}
