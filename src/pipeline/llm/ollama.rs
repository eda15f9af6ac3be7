use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::types::LlmClient;
use super::{body_rejects_images, LlmError};

/// Models tried in order when the configured one is not installed.
const PREFERRED_MODELS: &[&str] = &[
    "medgemma",
    "medgemma:27b",
    "medgemma:4b",
    "medgemma:latest",
];

/// Ollama HTTP client for local LLM inference.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    /// Create a new OllamaClient pointing at an Ollama instance.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    /// Default Ollama instance at localhost:11434 with 5-minute timeout.
    pub fn default_local() -> Result<Self, LlmError> {
        Self::new("http://localhost:11434", 300)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Return `preferred` if installed, else the best installed fallback model.
    pub fn find_best_model(&self, preferred: &str) -> Result<String, LlmError> {
        let available = self.list_models()?;
        if available.iter().any(|m| m.starts_with(preferred)) {
            return Ok(preferred.to_string());
        }
        for fallback in PREFERRED_MODELS {
            if available.iter().any(|m| m.starts_with(fallback)) {
                tracing::warn!(
                    requested = preferred,
                    using = fallback,
                    "Configured model not installed, falling back"
                );
                return Ok(fallback.to_string());
            }
        }
        Err(LlmError::NoModelAvailable)
    }

    fn post_generate(&self, body: &GenerateRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;

        Ok(parsed.response)
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_connect() {
            LlmError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            LlmError::HttpClient(format!("Request timed out after {}s", self.timeout_secs))
        } else {
            LlmError::HttpClient(e.to_string())
        }
    }
}

/// A model without a vision projector answers an image-carrying request with
/// an HTTP error; surface that as `VisionUnsupported` so callers can retry
/// text-only.
fn map_image_rejection(err: LlmError, model: &str, image_count: usize) -> LlmError {
    match err {
        LlmError::Api { ref body, .. } if image_count > 0 && body_rejects_images(body) => {
            tracing::warn!(model, image_count, "Model rejected image input");
            LlmError::VisionUnsupported(model.to_string())
        }
        other => other,
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
    stream: bool,
    options: GenerateOptions,
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

/// Deterministic decoding for extraction work.
#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl LlmClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError> {
        self.generate_with_images(model, prompt, system, &[])
    }

    fn generate_with_images(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        images: &[String],
    ) -> Result<String, LlmError> {
        let _span = tracing::debug_span!(
            "ollama_generate",
            model,
            prompt_len = prompt.len(),
            images = images.len(),
        )
        .entered();
        let start = std::time::Instant::now();

        let body = GenerateRequest {
            model,
            prompt,
            system,
            images,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };
        let response = self
            .post_generate(&body)
            .map_err(|e| map_image_rejection(e, model, images.len()))?;

        tracing::debug!(
            elapsed_ms = %start.elapsed().as_millis(),
            response_len = response.len(),
            "Generation complete"
        );
        Ok(response)
    }

    fn is_model_available(&self, model: &str) -> Result<bool, LlmError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

/// Fixed-response client for tests.
pub struct MockLlmClient {
    response: String,
    available_models: Vec<String>,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            available_models: vec!["medgemma:latest".to_string()],
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, _model: &str, _prompt: &str, _system: &str) -> Result<String, LlmError> {
        Ok(self.response.clone())
    }

    fn generate_with_images(
        &self,
        _model: &str,
        _prompt: &str,
        _system: &str,
        _images: &[String],
    ) -> Result<String, LlmError> {
        Ok(self.response.clone())
    }

    fn is_model_available(&self, model: &str) -> Result<bool, LlmError> {
        Ok(self.available_models.iter().any(|m| m.starts_with(model)))
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.available_models.clone())
    }
}

/// One recorded call made against a `ScriptedLlmClient`.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub prompt: String,
    pub system: String,
    pub image_count: usize,
}

type Responder = dyn Fn(&str, &str, usize) -> Result<String, LlmError> + Send + Sync;

/// Test client whose answer is computed from each request.
///
/// The closure receives `(prompt, system, image_count)`. Every call is
/// recorded so tests can assert on call order and count.
pub struct ScriptedLlmClient {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &str, usize) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn record(&self, model: &str, prompt: &str, system: &str, image_count: usize) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                model: model.to_string(),
                prompt: prompt.to_string(),
                system: system.to_string(),
                image_count,
            });
        }
    }
}

impl LlmClient for ScriptedLlmClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError> {
        self.record(model, prompt, system, 0);
        (self.responder)(prompt, system, 0)
    }

    fn generate_with_images(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        images: &[String],
    ) -> Result<String, LlmError> {
        self.record(model, prompt, system, images.len());
        (self.responder)(prompt, system, images.len())
    }

    fn is_model_available(&self, _model: &str) -> Result<bool, LlmError> {
        Ok(true)
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(vec!["medgemma:4b".to_string()])
    }
}
