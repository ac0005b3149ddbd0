use super::client::{map_transport_error, sanitize_api_response};
use super::{GenerationError, Provider, TextGenerator};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

const OPENAI_TEMPERATURE: f32 = 0.2;

/// Send a prepared request and decode a 2xx JSON body into `R`.
async fn send_json<R: DeserializeOwned>(
    provider: Provider,
    request: reqwest::RequestBuilder,
) -> Result<R, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|e| map_transport_error(provider, e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| map_transport_error(provider, e))?;

    if !status.is_success() {
        return Err(GenerationError::Http {
            provider,
            status: status.as_u16(),
            body: sanitize_api_response(&text),
        });
    }

    serde_json::from_str(&text).map_err(|e| GenerationError::Decode {
        provider,
        message: e.to_string(),
    })
}

fn non_empty(provider: Provider, text: Option<String>) -> Result<String, GenerationError> {
    match text {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(GenerationError::Empty { provider }),
    }
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn chat_messages(prompt: &str, system_instruction: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system_instruction.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        },
    ]
}

// ============================================================================
// Gemini
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
}

#[derive(Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
}

/// Text parts of the first candidate, joined by newlines.
fn gemini_text(response: GeminiResponse) -> Option<String> {
    let candidate = response.candidates.into_iter().next()?;
    let parts: Vec<String> = candidate
        .content
        .parts
        .into_iter()
        .map(|p| p.text.unwrap_or_default())
        .collect();
    Some(parts.join("\n"))
}

pub struct GeminiGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(&self, prompt: &str, system_instruction: &str) -> Result<String, GenerationError> {
        let provider = Provider::Gemini;
        if self.api_key.trim().is_empty() {
            return Err(GenerationError::MissingCredential { provider });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(system_instruction.to_string()),
                }],
            },
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: Some(prompt.to_string()),
                }],
            }],
        };

        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body);
        let response: GeminiResponse = send_json(provider, request).await?;
        non_empty(provider, gemini_text(response))
    }
}

impl TextGenerator for GeminiGenerator {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        system_instruction: &'a str,
    ) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.generate(prompt, system_instruction))
    }
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

fn openai_text(response: OpenAiResponse) -> Option<String> {
    response.choices.into_iter().next()?.message.content
}

pub struct OpenAiGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiGenerator {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
        }
    }

    /// Point at any OpenAI-compatible server (`.../v1`).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(&self, prompt: &str, system_instruction: &str) -> Result<String, GenerationError> {
        let provider = Provider::OpenAi;
        if self.api_key.trim().is_empty() {
            return Err(GenerationError::MissingCredential { provider });
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAiRequest {
            model: self.model.clone(),
            temperature: OPENAI_TEMPERATURE,
            messages: chat_messages(prompt, system_instruction),
        };

        let request = self.http.post(url).bearer_auth(&self.api_key).json(&body);
        let response: OpenAiResponse = send_json(provider, request).await?;
        non_empty(provider, openai_text(response))
    }
}

impl TextGenerator for OpenAiGenerator {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        system_instruction: &'a str,
    ) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.generate(prompt, system_instruction))
    }
}

// ============================================================================
// Ollama
// ============================================================================

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    stream: bool,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
}

fn ollama_text(response: OllamaResponse) -> Option<String> {
    response.message.map(|m| m.content)
}

pub struct OllamaGenerator {
    http: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(http: reqwest::Client, host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into(),
            model: model.into(),
        }
    }

    async fn generate(&self, prompt: &str, system_instruction: &str) -> Result<String, GenerationError> {
        let provider = Provider::Ollama;
        let url = format!("{}/api/chat", self.host.trim_end_matches('/'));
        let body = OllamaRequest {
            model: self.model.clone(),
            stream: false,
            messages: chat_messages(prompt, system_instruction),
        };

        let response: OllamaResponse = send_json(provider, self.http.post(url).json(&body)).await?;
        non_empty(provider, ollama_text(response))
    }
}

impl TextGenerator for OllamaGenerator {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        system_instruction: &'a str,
    ) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.generate(prompt, system_instruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_dropping_listener, spawn_mock, RecordedRequests};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    // ========================================================================
    // Extraction
    // ========================================================================

    #[test]
    fn test_gemini_text_joins_parts() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "a" }, { "text": "b" }] } }]
        }))
        .unwrap();
        assert_eq!(gemini_text(response).as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_gemini_text_no_candidates() {
        let response: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(gemini_text(response), None);
    }

    #[test]
    fn test_openai_text_reads_first_choice() {
        let response: OpenAiResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
        }))
        .unwrap();
        assert_eq!(openai_text(response).as_deref(), Some("hello"));
    }

    #[test]
    fn test_ollama_text_reads_message() {
        let response: OllamaResponse = serde_json::from_value(json!({
            "message": { "role": "assistant", "content": "hi" }, "done": true
        }))
        .unwrap();
        assert_eq!(ollama_text(response).as_deref(), Some("hi"));
    }

    // ========================================================================
    // Wire
    // ========================================================================

    #[tokio::test]
    async fn test_gemini_sends_key_and_system_instruction() {
        let recorded = RecordedRequests::default();
        let router = Router::new()
            .route(
                "/v1beta/models/:model",
                post(
                    |State(rec): State<RecordedRequests>,
                     headers: HeaderMap,
                     uri: Uri,
                     Json(body): Json<Value>| async move {
                        let key = headers
                            .get("x-goog-api-key")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        rec.push(json!({ "key": key, "query": uri.query(), "body": body }));
                        Json(json!({
                            "candidates": [{ "content": { "parts": [{ "text": "{\"files\":[]}" }] } }]
                        }))
                    },
                ),
            )
            .with_state(recorded.clone());
        let base = spawn_mock(router).await;

        let generator = GeminiGenerator::new(reqwest::Client::new(), "test-key", "gemini-2.5-flash")
            .with_base_url(base);
        let text = generator.generate_text("do it", "be careful").await.unwrap();
        assert_eq!(text, "{\"files\":[]}");

        let requests = recorded.all();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["key"], "test-key");
        assert_eq!(requests[0]["query"], Value::Null);
        assert_eq!(
            requests[0]["body"]["systemInstruction"]["parts"][0]["text"],
            "be careful"
        );
        assert_eq!(requests[0]["body"]["contents"][0]["role"], "user");
        assert_eq!(requests[0]["body"]["contents"][0]["parts"][0]["text"], "do it");
    }

    #[tokio::test]
    async fn test_dropped_connection_error_does_not_leak_api_key() {
        let (base, accepted) = spawn_dropping_listener().await;
        let generator = GeminiGenerator::new(reqwest::Client::new(), "AIzaSECRETKEY123", "m")
            .with_base_url(base);

        let err = generator.generate_text("p", "s").await.unwrap_err();
        assert!(matches!(err, GenerationError::Transport { .. }), "{:?}", err);
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("SECRETKEY"), "{}", err);
        assert!(!format!("{:?}", err).contains("SECRETKEY"));
        assert!(accepted.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_openai_maps_http_error_status() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = spawn_mock(router).await;

        let generator = OpenAiGenerator::new(reqwest::Client::new(), "sk-test", "gpt-4o-mini")
            .with_base_url(format!("{}/v1", base));
        let err = generator.generate_text("p", "s").await.unwrap_err();
        assert!(matches!(err, GenerationError::Http { status: 429, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_openai_requires_api_key() {
        let generator = OpenAiGenerator::new(reqwest::Client::new(), "", "gpt-4o-mini");
        let err = generator.generate_text("p", "s").await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::MissingCredential {
                provider: Provider::OpenAi
            }
        );
    }

    #[tokio::test]
    async fn test_ollama_disables_streaming_and_rejects_empty_reply() {
        let recorded = RecordedRequests::default();
        let router = Router::new()
            .route(
                "/api/chat",
                post(
                    |State(rec): State<RecordedRequests>, Json(body): Json<Value>| async move {
                        rec.push(body);
                        Json(json!({ "message": { "role": "assistant", "content": "  " } }))
                    },
                ),
            )
            .with_state(recorded.clone());
        let base = spawn_mock(router).await;

        let generator = OllamaGenerator::new(reqwest::Client::new(), base, "llama3.1:8b");
        let err = generator.generate_text("p", "s").await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Empty {
                provider: Provider::Ollama
            }
        );

        let requests = recorded.all();
        assert_eq!(requests[0]["stream"], false);
        assert_eq!(requests[0]["messages"][0]["role"], "system");
        assert_eq!(requests[0]["messages"][1]["content"], "p");
    }
}
