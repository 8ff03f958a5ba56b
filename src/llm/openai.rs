use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use super::{CompletionRequest, CompletionService, TransportError};
use crate::config::LlmSection;

/// Chat completions against an OpenAI-compatible endpoint.
pub struct OpenAiCompletionService {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiCompletionService {
    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn from_config(config: &LlmSection) -> Self {
        Self::new(
            config.api_key.clone(),
            config.api_base.clone(),
            config.model.clone(),
        )
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = vec![json!({"role": "system", "content": request.instructions})];
        for message in &request.messages {
            messages.push(json!({"role": message.role.as_str(), "content": message.content}));
        }
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

fn classify_status(status: StatusCode, text: &str) -> TransportError {
    let detail = format!("OpenAI error {}: {}", status, text);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransportError::Transient(detail)
    } else {
        TransportError::Fatal(detail)
    }
}

/// Connection and in-flight failures are worth retrying; a request that
/// could not even be built (bad URL, bad header) never will succeed.
fn classify_send_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() || e.is_redirect() {
        TransportError::Fatal(format!("Invalid request: {}", e))
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, TransportError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TransportError::Fatal("OPENAI_API_KEY is not configured".into()))?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Fatal(format!("Malformed response body: {}", e)))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TransportError::Fatal("Response has no message content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptMessage;
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
    use modelsmith_common::Role;

    fn request() -> CompletionRequest {
        CompletionRequest {
            instructions: "be helpful".into(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: "hi".into(),
            }],
            max_tokens: 10,
            temperature: 0.2,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_body_puts_instructions_first() {
        let service = OpenAiCompletionService::new(None, "http://x".into(), "gpt-4-turbo".into());
        let body = service.body(&request());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be helpful");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["model"], "gpt-4-turbo");
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            TransportError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_fatal() {
        let service = OpenAiCompletionService::new(None, "http://127.0.0.1:9".into(), "m".into());
        assert!(matches!(
            service.complete(&request()).await,
            Err(TransportError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let service =
            OpenAiCompletionService::new(Some("sk-test".into()), "http://127.0.0.1:9".into(), "m".into());
        assert!(matches!(
            service.complete(&request()).await,
            Err(TransportError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_base_url_is_fatal() {
        let service =
            OpenAiCompletionService::new(Some("sk-test".into()), "not a url".into(), "m".into());
        assert!(matches!(
            service.complete(&request()).await,
            Err(TransportError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_message_content() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
                }))
            }),
        );
        let base = serve(router).await;
        let service = OpenAiCompletionService::new(Some("sk-test".into()), base, "m".into());
        assert_eq!(service.complete(&request()).await.unwrap(), "hello there");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = serve(router).await;
        let service = OpenAiCompletionService::new(Some("sk-test".into()), base, "m".into());
        assert!(matches!(
            service.complete(&request()).await,
            Err(TransportError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_envelope_without_content_is_fatal() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(serde_json::json!({"choices": []})) }),
        );
        let base = serve(router).await;
        let service = OpenAiCompletionService::new(Some("sk-test".into()), base, "m".into());
        assert!(matches!(
            service.complete(&request()).await,
            Err(TransportError::Fatal(_))
        ));
    }
}
