//! OpenAI-compatible backend
//!
//! Talks to a local server exposing the OpenAI chat API (for example
//! `mlc_llm serve`). Loading checks that the server hosts the requested
//! model; completions are plain non-streaming chat requests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::inference::backend::{BackendError, BackendFactory, InferenceBackend, ProgressSink};
use crate::types::message::{ChatCompletion, Choice, Message, Role};
use crate::types::model::{ModelConfig, ModelDescriptor};

// ============================================================================
// Configuration
// ============================================================================

/// Connection and sampling options
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Base URL, e.g. `http://127.0.0.1:8000/v1`
    pub endpoint: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Option<Vec<WireChoice>>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

fn api_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path)
}

fn parse_completion(body: &str) -> Result<ChatCompletion, BackendError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse response: {e}")))?;

    if let Some(error) = response.error {
        return Err(BackendError::Other(error.message));
    }

    let choices = response
        .choices
        .unwrap_or_default()
        .into_iter()
        .map(|choice| Choice {
            message: Message::new(Role::Assistant, choice.message.content.unwrap_or_default()),
            finish_reason: choice.finish_reason,
        })
        .collect();

    Ok(ChatCompletion { choices })
}

/// Served id matching `model_id`, either exactly or under a path prefix
/// such as `HF://mlc-ai/<id>`
fn find_served(served: Vec<String>, model_id: &str) -> Option<String> {
    let suffix = format!("/{model_id}");
    served
        .into_iter()
        .find(|id| id == model_id || id.ends_with(&suffix))
}

/// Never ask for more tokens than the model's context window holds
fn bounded_max_tokens(requested: u32, context_window: Option<u32>) -> u32 {
    match context_window {
        Some(window) => requested.min(window),
        None => requested,
    }
}

fn error_message(status: u16, body: &str) -> BackendError {
    let message = serde_json::from_str::<CompletionResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .map(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string());
    BackendError::Api { status, message }
}

// ============================================================================
// Backend
// ============================================================================

pub struct OpenAiBackend {
    client: reqwest::Client,
    options: BackendOptions,
    model: Option<String>,
    context_window: Option<u32>,
}

impl OpenAiBackend {
    pub fn new(options: BackendOptions) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            client,
            options,
            model: None,
            context_window: None,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.options.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    async fn served_models(&self) -> Result<Vec<String>, BackendError> {
        let url = api_url(&self.options.endpoint, "models");
        let response = self.authorized(self.client.get(url)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_message(status.as_u16(), &body));
        }
        let models: ModelsResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse model list: {e}")))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn load(
        &mut self,
        model: &ModelDescriptor,
        config: &ModelConfig,
        progress: &ProgressSink,
    ) -> Result<(), BackendError> {
        self.model = None;
        self.context_window = None;
        progress.step(0.1, format!("Connecting to {}", self.options.endpoint));

        let served = self.served_models().await?;
        progress.step(0.5, format!("Checking model {model}"));

        let found = find_served(served, config.model_id)
            .ok_or_else(|| BackendError::ModelUnavailable(config.model_id.to_string()))?;

        tracing::debug!(model = %model, served_as = %found, "Model available on server");
        self.model = Some(found);
        self.context_window = Some(config.context_window_size);
        progress.step(1.0, format!("Finish loading on {}", self.options.endpoint));
        Ok(())
    }

    async fn complete(&mut self, messages: Vec<Message>) -> Result<ChatCompletion, BackendError> {
        let model = self.model.as_deref().ok_or(BackendError::NotLoaded)?;
        let request = CompletionRequest {
            model,
            messages: &messages,
            temperature: self.options.temperature,
            top_p: self.options.top_p,
            max_tokens: bounded_max_tokens(self.options.max_tokens, self.context_window),
            stream: false,
        };

        let url = api_url(&self.options.endpoint, "chat/completions");
        let response = self
            .authorized(self.client.post(url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_message(status.as_u16(), &body));
        }

        parse_completion(&body)
    }
}

/// Builds an [`OpenAiBackend`] for every new worker
pub struct OpenAiBackendFactory {
    options: BackendOptions,
}

impl OpenAiBackendFactory {
    pub fn new(options: BackendOptions) -> Self {
        Self { options }
    }
}

impl BackendFactory for OpenAiBackendFactory {
    fn create(&self) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(OpenAiBackend::new(self.options.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::catalog::ModelCatalog;
    use crate::inference::worker::LoadEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const LLAMA: &str = "Llama-3-8B-Instruct-q4f32_1-MLC";

    fn options(endpoint: String) -> BackendOptions {
        BackendOptions {
            endpoint,
            api_key: None,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 64,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Answers every request with `body` as JSON until the test ends
    async fn serve_json(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/v1")
    }

    async fn load_against(body: &'static str) -> (Result<(), BackendError>, Vec<f64>) {
        let endpoint = serve_json(body).await;
        let mut backend = OpenAiBackend::new(options(endpoint)).unwrap();
        let catalog = ModelCatalog::builtin();
        let model = catalog.find(LLAMA).unwrap().clone();
        let config = catalog.config(&model).unwrap().clone();

        let (events, mut inbox) = mpsc::unbounded_channel();
        let result = backend
            .load(&model, &config, &ProgressSink::new(events))
            .await;

        let mut steps = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            if let LoadEvent::Progress(report) = event {
                steps.push(report.progress);
            }
        }
        (result, steps)
    }

    #[test]
    fn test_find_served_exact_and_prefixed() {
        let exact = vec!["other".to_string(), LLAMA.to_string()];
        assert_eq!(find_served(exact, LLAMA).as_deref(), Some(LLAMA));

        let prefixed = vec![format!("HF://mlc-ai/{LLAMA}")];
        assert_eq!(
            find_served(prefixed, LLAMA),
            Some(format!("HF://mlc-ai/{LLAMA}"))
        );
    }

    #[test]
    fn test_find_served_missing() {
        let served = vec!["Phi-3-mini-4k-instruct-q4f16_1-MLC".to_string()];
        assert_eq!(find_served(served, LLAMA), None);
        // A longer id that merely ends with the name is not a match
        let served = vec![format!("x{LLAMA}")];
        assert_eq!(find_served(served, LLAMA), None);
    }

    #[test]
    fn test_max_tokens_bounded_by_context() {
        assert_eq!(bounded_max_tokens(8192, Some(4096)), 4096);
        assert_eq!(bounded_max_tokens(512, Some(4096)), 512);
        assert_eq!(bounded_max_tokens(8192, None), 8192);
    }

    #[tokio::test]
    async fn test_complete_before_load_is_rejected() {
        let mut backend = OpenAiBackend::new(options("http://127.0.0.1:9/v1".into())).unwrap();
        let err = backend
            .complete(vec![Message::user("hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotLoaded));
    }

    #[tokio::test]
    async fn test_load_finds_prefixed_model() {
        let (result, steps) = load_against(
            r#"{"object":"list","data":[{"id":"HF://mlc-ai/Llama-3-8B-Instruct-q4f32_1-MLC"}]}"#,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(steps, vec![0.1, 0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_load_fails_when_model_not_served() {
        let (result, steps) =
            load_against(r#"{"data":[{"id":"Phi-3-mini-4k-instruct-q4f16_1-MLC"}]}"#).await;
        match result {
            Err(BackendError::ModelUnavailable(id)) => assert_eq!(id, LLAMA),
            other => panic!("expected unavailable model, got {other:?}"),
        }
        assert_eq!(steps, vec![0.1, 0.5]);
    }

    #[test]
    fn test_api_url_trims_slash() {
        assert_eq!(
            api_url("http://127.0.0.1:8000/v1/", "chat/completions"),
            "http://127.0.0.1:8000/v1/chat/completions"
        );
        assert_eq!(api_url("http://h/v1", "models"), "http://h/v1/models");
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hi there"},"finish_reason":"stop"}]}"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.first_content(), Some("Hi there"));
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_completion_error_body() {
        let body = r#"{"error":{"message":"model overloaded"}}"#;
        let err = parse_completion(body).unwrap_err();
        assert_eq!(err.to_string(), "model overloaded");
    }

    #[test]
    fn test_error_message_prefers_api_error() {
        let err = error_message(503, r#"{"error":{"message":"busy"}}"#);
        assert_eq!(err.to_string(), "API error (503): busy");

        let err = error_message(500, " plain failure \n");
        assert_eq!(err.to_string(), "API error (500): plain failure");
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![Message::system("sys"), Message::user("hello")];
        let request = CompletionRequest {
            model: "m",
            messages: &messages,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 16,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["stream"], false);
    }
}
