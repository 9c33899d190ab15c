use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{LlmConfig, LlmProvider};

const OPENROUTER_REFERER: &str = "https://github.com/choicebot/choicebot";
const OPENROUTER_TITLE: &str = "Decision Bot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A single-shot completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Candidate texts in provider order, plus token usage when reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub choices: Vec<String>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Anything that can turn chat messages into completions.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    n: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: Option<u32>,
}

/// OpenAI-compatible `/chat/completions` client (OpenRouter, OpenAI, Ollama).
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provider: LlmProvider,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.effective_base_url().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            provider: config.provider.clone(),
        }
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> CompletionError {
        if err.is_timeout() {
            CompletionError::Timeout(timeout)
        } else if err.is_decode() {
            CompletionError::Malformed(err.to_string())
        } else {
            CompletionError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            n: 1,
        };

        let url = format!("{}/chat/completions", self.base_url);

        debug!("Sending request to {} ({})", url, self.provider);

        let mut builder = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .header("Content-Type", "application/json")
            .json(&body);

        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        if self.provider == LlmProvider::Openrouter {
            builder = builder
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(CompletionError::RateLimited(error_body));
            }
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body: error_body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;

        let chat_response: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;

        Ok(Completion {
            choices: chat_response
                .choices
                .into_iter()
                .map(|c| c.message.content.unwrap_or_default())
                .collect(),
            total_tokens: chat_response.usage.and_then(|u| u.total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String, provider: LlmProvider) -> LlmClient {
        LlmClient::new(&LlmConfig {
            provider,
            model: "test-model".to_string(),
            base_url,
            api_key: "sk-test".to_string(),
            max_tokens: 150,
            temperature: 0.7,
        })
    }

    fn request(timeout: Duration) -> CompletionRequest {
        CompletionRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            max_tokens: 150,
            temperature: 0.7,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let app = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                assert_eq!(body["max_tokens"], 150);
                assert_eq!(body["messages"][1]["role"], "user");
                Json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "Рекомендую A. Так лучше." } }],
                    "usage": { "total_tokens": 42 }
                }))
            }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let completion = client.complete(request(Duration::from_secs(5))).await.unwrap();
        assert_eq!(completion.choices, vec!["Рекомендую A. Так лучше."]);
        assert_eq!(completion.total_tokens, Some(42));
    }

    #[tokio::test]
    async fn test_openrouter_headers_are_sent() {
        let app = Router::new().route(
            "/chat/completions",
            post(|headers: axum::http::HeaderMap| async move {
                let title = headers
                    .get("X-Title")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let auth = headers
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({ "choices": [{ "message": { "content": format!("{title}|{auth}") } }] }))
            }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openrouter);

        let completion = client.complete(request(Duration::from_secs(5))).await.unwrap();
        assert_eq!(completion.choices, vec!["Decision Bot|Bearer sk-test"]);
        assert_eq!(completion.total_tokens, None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_classified() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let err = client.complete(request(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, CompletionError::RateLimited(ref body) if body == "slow down"));
    }

    #[tokio::test]
    async fn test_api_error_is_classified() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let err = client.complete(request(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, CompletionError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "choices": [] }))
            }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let err = client
            .complete(request(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_classified() {
        let app = Router::new().route("/chat/completions", post(|| async { "not json" }));
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let err = client.complete(request(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_empty_choices_are_not_an_error() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({ "choices": [] })) }),
        );
        let client = client_for(spawn_server(app).await, LlmProvider::Openai);

        let completion = client.complete(request(Duration::from_secs(5))).await.unwrap();
        assert!(completion.choices.is_empty());
    }
}
