//! OpenAI-compatible chat completions client (OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use granthub_shared::{GrantHubError, Result};

use crate::{GenerationConfig, Prompt, TextGenerator};

/// User-Agent string for generation requests.
const USER_AGENT: &str = concat!("GrantHub/", env!("CARGO_PKG_VERSION"));

/// Body fragments that mark a rate-limit or quota rejection.
const RATE_LIMIT_MARKERS: [&str; 3] = ["quota", "rate limit", "rate_limit"];

/// Connection settings for [`OpenRouterClient`].
#[derive(Debug, Clone)]
pub struct OpenRouterOptions {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// Chat completions client implementing [`TextGenerator`].
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl OpenRouterClient {
    pub fn new(options: OpenRouterOptions) -> Result<Self> {
        let base = options.base_url.trim_end_matches('/');
        let endpoint = Url::parse(&format!("{base}/chat/completions")).map_err(|e| {
            GrantHubError::config(format!("invalid llm base_url {:?}: {e}", options.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| {
                GrantHubError::RequestFailed(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint,
            api_key: options.api_key,
            model: options.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn generate(&self, prompt: &Prompt, config: &GenerationConfig) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = prompt.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_tokens: config.max_tokens,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GrantHubError::RequestFailed(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            GrantHubError::RequestFailed(format!("failed to read response body: {e}"))
        })?;

        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| GrantHubError::RequestFailed(format!("unexpected response body: {e}")))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            let code_is_429 = error
                .code
                .as_ref()
                .is_some_and(|c| c.as_u64() == Some(429) || c.as_str() == Some("429"));
            if code_is_429 || mentions_rate_limit(&message) {
                return Err(GrantHubError::RateLimited { attempts: 1 });
            }
            return Err(GrantHubError::RequestFailed(message));
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GrantHubError::RequestFailed("response had no choices".into()))?;

        debug!(chars = content.len(), "generation complete");
        Ok(content.trim().to_string())
    }
}

fn classify_failure(status: StatusCode, body: &str) -> GrantHubError {
    if status == StatusCode::TOO_MANY_REQUESTS || mentions_rate_limit(body) {
        GrantHubError::RateLimited { attempts: 1 }
    } else {
        GrantHubError::RequestFailed(format!("HTTP {status}: {}", body.trim()))
    }
}

fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenRouterClient {
        OpenRouterClient::new(OpenRouterOptions {
            base_url: format!("{}/api/v1", server.uri()),
            api_key: "sk-test".into(),
            model: "test/model".into(),
            timeout_secs: 5,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "test/model",
                "top_k": 40,
                "max_tokens": 2048
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "  [\"A\"]  " } }]
            })))
            .mount(&server)
            .await;

        let prompt = Prompt::user("list grants").with_system("json only");
        let text = client_for(&server)
            .generate(&prompt, &GenerationConfig::detail())
            .await
            .unwrap();
        assert_eq!(text, "[\"A\"]");
    }

    #[tokio::test]
    async fn status_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&Prompt::user("x"), &GenerationConfig::listing())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn quota_message_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string("Quota exceeded for this key"),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&Prompt::user("x"), &GenerationConfig::listing())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn embedded_error_with_429_code_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Provider returned error" }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&Prompt::user("x"), &GenerationConfig::listing())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn other_failures_are_request_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&Prompt::user("x"), &GenerationConfig::listing())
            .await
            .unwrap_err();
        assert!(matches!(err, GrantHubError::RequestFailed(ref m) if m.contains("500")));
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = OpenRouterClient::new(OpenRouterOptions {
            base_url: "not a url".into(),
            api_key: "k".into(),
            model: "m".into(),
            timeout_secs: 5,
        })
        .unwrap_err();
        assert!(matches!(err, GrantHubError::Config { .. }));
    }
}
