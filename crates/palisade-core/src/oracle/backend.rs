//! Completion backend — the external LLM collaborator.
//!
//! The oracle only ever exchanges a model name, a prompt, and a temperature
//! for a JSON-formatted completion. Everything else about the backend is
//! opaque, and every failure mode (non-200, timeout, transport, missing
//! text) surfaces as a typed [`BackendError`] the oracle degrades around.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::BackendError;

/// One completion exchange.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
}

/// A text-completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f64,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// HTTP backend speaking the Ollama-style `/api/generate` protocol.
pub struct HttpCompletionBackend {
    endpoint: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpCompletionBackend {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self {
            endpoint: endpoint.into(),
            timeout_secs,
            client,
        }
    }

    /// Check backend reachability and list available models. Logging only —
    /// an unreachable backend just means the oracle will run degraded.
    pub async fn probe(&self) -> Option<Vec<String>> {
        let url = format!("{}/api/tags", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let tags: TagsResponse = response.json().await.ok()?;
                let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
                info!(models = ?names, "completion backend reachable");
                Some(names)
            }
            Ok(response) => {
                warn!(status = %response.status(), "completion backend probe rejected");
                None
            }
            Err(err) => {
                warn!(error = %err, "completion backend unreachable, oracle will run degraded");
                None
            }
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            temperature: request.temperature,
            stream: false,
            format: "json",
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    BackendError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    BackendError::Transport(err)
                }
            })?;

        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(BackendError::Transport)?;
        parsed.response.ok_or(BackendError::EmptyCompletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_wire_shape() {
        let body = GenerateRequest {
            model: "llama3.2:latest",
            prompt: "analyze this",
            temperature: 0.3,
            stream: false,
            format: "json",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3.2:latest");
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"], "json");
    }

    #[test]
    fn test_generate_response_tolerates_missing_text() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.response.is_none());
    }
}
