//! HTTP inference backends.
//!
//! - [`LlamaCppBackend`]: local llama.cpp server (`POST /completion`)
//! - [`OpenAiCompatBackend`]: any OpenAI-compatible chat endpoint
//!   (`POST /v1/chat/completions`)
//! - [`AnthropicBackend`]: Anthropic Messages API (`POST /v1/messages`)
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: default key variable for [`OpenAiCompatBackend`]
//! - `ANTHROPIC_API_KEY`: default key variable for [`AnthropicBackend`]
//! - `LLAMA_CPP_URL`: llama.cpp server URL (default: http://localhost:8080)
//!
//! Response status codes are classified by [`classify_status`]. Error
//! messages carry the status code only; response bodies and keys are never
//! echoed back.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Backend, BackendError, Completion};
use crate::RouterError;

/// Map a non-success HTTP status to a [`BackendError`].
///
/// 429 is a quota rejection, 408/504 are timeouts, any other 5xx means the
/// backend is unavailable, and remaining 4xx codes are invalid responses.
pub fn classify_status(status: StatusCode) -> BackendError {
    match status.as_u16() {
        429 => BackendError::QuotaExceeded(format!("HTTP {}", status.as_u16())),
        408 | 504 => BackendError::Timeout,
        500..=599 => BackendError::Unavailable(format!("HTTP {}", status.as_u16())),
        code => BackendError::InvalidResponse(format!("HTTP {code}")),
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else if e.is_decode() {
        BackendError::InvalidResponse(format!("undecodable body: {}", e.without_url()))
    } else {
        BackendError::Unavailable(format!("request failed: {}", e.without_url()))
    }
}

async fn send_json<T: for<'de> Deserialize<'de>>(
    request: reqwest::RequestBuilder,
) -> Result<T, BackendError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status));
    }
    response.json::<T>().await.map_err(|e| {
        BackendError::InvalidResponse(format!("failed to parse response: {}", e.without_url()))
    })
}

fn key_from_env(var: &str) -> Result<String, RouterError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(RouterError::Config(format!(
            "{var} environment variable not set"
        ))),
    }
}

fn trim_url(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

// ============================================================================
// llama.cpp
// ============================================================================

#[derive(Debug, Serialize)]
struct LlamaCppRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    stop: [&'static str; 2],
}

#[derive(Debug, Deserialize)]
struct LlamaCppResponse {
    content: String,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
}

/// llama.cpp server URL used when `LLAMA_CPP_URL` is unset.
pub const DEFAULT_LLAMA_CPP_URL: &str = "http://localhost:8080";

/// Local llama.cpp server backend.
///
/// ## Example
///
/// ```no_run
/// use tokio_cost_router::backend::LlamaCppBackend;
///
/// let backend = LlamaCppBackend::new()
///     .with_base_url("http://localhost:8080")
///     .with_max_tokens(512);
/// ```
#[derive(Debug, Clone)]
pub struct LlamaCppBackend {
    client: reqwest::Client,
    url: String,
    max_tokens: u32,
    temperature: f32,
}

impl LlamaCppBackend {
    /// Create a backend pointed at `LLAMA_CPP_URL`, or
    /// `http://localhost:8080` when unset.
    pub fn new() -> Self {
        let url = std::env::var("LLAMA_CPP_URL")
            .unwrap_or_else(|_| DEFAULT_LLAMA_CPP_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            url: trim_url(url),
            max_tokens: 256,
            temperature: 0.8,
        }
    }

    /// Set server URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = trim_url(url);
        self
    }

    /// Set maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama_cpp"
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, BackendError> {
        let body = LlamaCppRequest {
            prompt,
            n_predict: self.max_tokens,
            temperature: self.temperature,
            stop: ["</s>", "Human:"],
        };
        let resp: LlamaCppResponse =
            send_json(self.client.post(format!("{}/completion", self.url)).json(&body)).await?;
        Ok(Completion {
            text: resp.content,
            prompt_tokens: resp.tokens_evaluated,
            completion_tokens: resp.tokens_predicted,
        })
    }

    async fn health(&self) -> bool {
        match self.client.get(format!("{}/health", self.url)).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// OpenAI-compatible chat completions backend.
///
/// Works against api.openai.com as well as self-hosted servers (vLLM,
/// llama.cpp in OpenAI mode) that expose `/v1/chat/completions`.
///
/// ## Example
///
/// ```no_run
/// use tokio_cost_router::backend::OpenAiCompatBackend;
///
/// let backend = OpenAiCompatBackend::new("gpt-4o-mini", "sk-...")
///     .with_base_url("http://localhost:8000")
///     .with_max_tokens(512);
/// ```
#[derive(Clone)]
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl std::fmt::Debug for OpenAiCompatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OpenAiCompatBackend {
    /// Create a backend with an explicit key.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 256,
            temperature: 0.7,
        }
    }

    /// Create a backend reading its key from the environment variable `var`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if `var` is unset or empty.
    pub fn from_env(model: impl Into<String>, var: &str) -> Result<Self, RouterError> {
        Ok(Self::new(model, key_from_env(var)?))
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = trim_url(url);
        self
    }

    /// Set maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature (0.0 - 2.0).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, BackendError> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let resp: OpenAiResponse = send_json(
            self.client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let text = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("no choices in response".to_string()))?;
        Ok(Completion {
            text,
            prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
        })
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Anthropic
// ============================================================================

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Anthropic Messages API backend.
///
/// ## Example
///
/// ```no_run
/// use tokio_cost_router::backend::AnthropicBackend;
///
/// let backend = AnthropicBackend::from_env("claude-3-5-sonnet-20241022", "ANTHROPIC_API_KEY")
///     .map(|b| b.with_max_tokens(1024));
/// ```
#[derive(Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl AnthropicBackend {
    /// Create a backend with an explicit key.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 1024,
            temperature: 1.0,
        }
    }

    /// Create a backend reading its key from the environment variable `var`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if `var` is unset or empty.
    pub fn from_env(model: impl Into<String>, var: &str) -> Result<Self, RouterError> {
        Ok(Self::new(model, key_from_env(var)?))
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = trim_url(url);
        self
    }

    /// Set maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature (0.0 - 1.0).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, BackendError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let resp: AnthropicResponse = send_json(
            self.authed(self.client.post(format!("{}/v1/messages", self.base_url)))
                .json(&body),
        )
        .await?;

        let text: String = resp
            .content
            .iter()
            .filter(|c| c.kind == "text")
            .map(|c| c.text.as_str())
            .collect();
        if text.is_empty() {
            return Err(BackendError::InvalidResponse(
                "no text content in response".to_string(),
            ));
        }
        Ok(Completion {
            text,
            prompt_tokens: resp.usage.as_ref().map(|u| u.input_tokens),
            completion_tokens: resp.usage.as_ref().map(|u| u.output_tokens),
        })
    }

    async fn health(&self) -> bool {
        match self
            .authed(self.client.get(format!("{}/v1/models", self.base_url)))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_classify_status_table() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            BackendError::QuotaExceeded(_)
        ));
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT),
            BackendError::Timeout
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            BackendError::Timeout
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            BackendError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_llama_cpp_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": "Paris",
                "tokens_evaluated": 7,
                "tokens_predicted": 1
            })))
            .mount(&server)
            .await;

        let b = LlamaCppBackend::new().with_base_url(server.uri());
        let c = b.complete("capital of France").await.unwrap();
        assert_eq!(c.text, "Paris");
        assert_eq!(c.billed_tokens("ignored"), 8);
    }

    #[tokio::test]
    async fn test_openai_sends_bearer_and_parses_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2}
            })))
            .mount(&server)
            .await;

        let b = OpenAiCompatBackend::new("gpt-4o-mini", "test-key").with_base_url(server.uri());
        let c = b.complete("hello").await.unwrap();
        assert_eq!(c.text, "hi there");
        assert_eq!(c.prompt_tokens, Some(3));
    }

    #[tokio::test]
    async fn test_openai_empty_choices_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let b = OpenAiCompatBackend::new("m", "k").with_base_url(server.uri());
        assert!(matches!(
            b.complete("x").await,
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_anthropic_headers_and_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "secret"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " world"}],
                "usage": {"input_tokens": 5, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let b = AnthropicBackend::new("claude", "secret").with_base_url(server.uri());
        let c = b.complete("hi").await.unwrap();
        assert_eq!(c.text, "Hello world");
        assert_eq!(c.billed_tokens("hi"), 7);
    }

    #[tokio::test]
    async fn test_error_message_does_not_echo_body_or_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("secret stack trace"))
            .mount(&server)
            .await;

        let b = AnthropicBackend::new("claude", "sk-very-secret").with_base_url(server.uri());
        let err = b.complete("private prompt").await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(!msg.contains("secret"));
        assert!(!msg.contains("private prompt"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let b = LlamaCppBackend::new().with_base_url("http://127.0.0.1:1");
        assert!(matches!(
            b.complete("x").await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(!b.health().await);
    }

    #[test]
    fn test_debug_redacts_key() {
        let b = OpenAiCompatBackend::new("m", "sk-123");
        assert!(!format!("{b:?}").contains("sk-123"));
    }

    #[test]
    fn test_from_env_missing_key_is_config_error() {
        let r = AnthropicBackend::from_env("claude", "ROUTER_TEST_SURELY_UNSET_KEY");
        assert!(matches!(r, Err(RouterError::Config(_))));
    }
}
