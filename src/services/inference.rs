//! Language-model inference service.
//!
//! Inference is strictly optional polish: enrichment hints and narrative
//! smoothing. Every caller has a deterministic fallback, so failures here
//! degrade quality, never availability. The disabled configuration swaps in
//! [`NullInference`], which refuses every call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::InferenceSettings;
use crate::error::InferenceError;
use crate::metrics::get_metrics;

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Free-form completion.
    async fn complete(&self, prompt: &str) -> Result<String, InferenceError>;

    /// Completion that must parse as a JSON object. Code fences around the
    /// object are tolerated and stripped.
    async fn complete_json(&self, prompt: &str) -> Result<serde_json::Value, InferenceError> {
        let raw = self.complete(prompt).await?;
        let stripped = strip_code_fences(&raw);
        serde_json::from_str(stripped)
            .map_err(|e| InferenceError::MalformedOutput(format!("{e}: {}", head(stripped))))
    }

    fn enabled(&self) -> bool;
}

/// Build the configured inference service.
pub fn create_inference(
    settings: &InferenceSettings,
) -> Result<Arc<dyn InferenceService>, InferenceError> {
    if settings.enabled {
        Ok(Arc::new(HttpInference::new(settings)?))
    } else {
        Ok(Arc::new(NullInference))
    }
}

// ============================================================================
// Disabled implementation
// ============================================================================

/// Stand-in when inference is configured off. Callers fall back to their
/// deterministic paths.
pub struct NullInference;

#[async_trait]
impl InferenceService for NullInference {
    async fn complete(&self, _prompt: &str) -> Result<String, InferenceError> {
        Err(InferenceError::Disabled)
    }

    fn enabled(&self) -> bool {
        false
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    completion: String,
}

pub struct HttpInference {
    client: Client,
    base_url: String,
    model: String,
    timeout_ms: u64,
}

impl HttpInference {
    pub fn new(settings: &InferenceSettings) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| InferenceError::Request(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            timeout_ms: settings.timeout_secs * 1000,
        })
    }
}

#[async_trait]
impl InferenceService for HttpInference {
    async fn complete(&self, prompt: &str) -> Result<String, InferenceError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/complete", self.base_url))
            .json(&CompleteRequest {
                model: &self.model,
                prompt,
                temperature: 0.2,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout_ms)
                } else {
                    InferenceError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Request(format!(
                "completion returned {status}: {}",
                head(&body)
            )));
        }

        let parsed: CompleteResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;
        get_metrics()
            .inference_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        debug!(chars = parsed.completion.len(), "inference completed");
        Ok(parsed.completion)
    }

    fn enabled(&self) -> bool {
        true
    }
}

/// Remove a surrounding markdown code fence, with or without a language tag.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn head(text: &str) -> String {
    text.chars().take(120).collect()
}
