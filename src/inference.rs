/// Inference client module
///
/// Submits a `CaptureBundle` to the multimodal classification service as a
/// multipart request and parses the per-modality response.

use crate::capture::CaptureBundle;
use crate::config::EngineConfig;
use crate::state::ModalityLabel;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Request failed: {0}")]
    ServerError(u16),

    #[error("Invalid response: {0}")]
    PayloadError(String),
}

/// Per-modality result of a successful request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ModalityOutcome {
    Detected(ModalityLabel),

    /// Absent, empty, or the `"none"` label
    NotDetected,

    /// Server reported an error for just this modality
    Failed(String),
}

impl ModalityOutcome {
    pub fn label(&self) -> Option<&ModalityLabel> {
        match self {
            ModalityOutcome::Detected(label) => Some(label),
            _ => None,
        }
    }
}

/// Parsed prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub visual: ModalityOutcome,
    pub audio: ModalityOutcome,
    pub confidence: f32,
    /// Server-annotated frame as a data URL
    pub annotated_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ModalityErrors {
    #[serde(default)]
    visual: Option<String>,
    #[serde(default)]
    audio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    visual: Option<LabelPayload>,
    #[serde(default)]
    audio: Option<LabelPayload>,
    #[serde(default)]
    confidence_score: Option<f32>,
    #[serde(default)]
    annotated_image: Option<String>,
    #[serde(default)]
    errors: Option<ModalityErrors>,
    #[serde(default)]
    error: Option<String>,
}

fn outcome(payload: Option<LabelPayload>, error: Option<String>) -> ModalityOutcome {
    if let Some(message) = error.filter(|m| !m.is_empty()) {
        return ModalityOutcome::Failed(message);
    }

    match payload {
        Some(LabelPayload {
            label: Some(label),
            confidence,
        }) if !label.trim().is_empty() && !label.trim().eq_ignore_ascii_case("none") => {
            ModalityOutcome::Detected(ModalityLabel::new(label, confidence.unwrap_or(0.0)))
        }
        _ => ModalityOutcome::NotDetected,
    }
}

/// Prefix raw base64 with a JPEG data URL header
pub fn normalize_image_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.starts_with("data:") {
        Some(trimmed.to_string())
    } else {
        Some(format!("data:image/jpeg;base64,{}", trimmed))
    }
}

/// Parse a success-status response body
///
/// A top-level `error` field fails the whole request.
pub fn parse_prediction(body: &[u8]) -> Result<Prediction, InferenceError> {
    let response: PredictionResponse =
        serde_json::from_slice(body).map_err(|e| InferenceError::PayloadError(e.to_string()))?;

    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        return Err(InferenceError::PayloadError(error));
    }

    let errors = response.errors.unwrap_or_default();
    let confidence = response
        .confidence_score
        .filter(|c| c.is_finite())
        .unwrap_or(0.0);

    Ok(Prediction {
        visual: outcome(response.visual, errors.visual),
        audio: outcome(response.audio, errors.audio),
        confidence,
        annotated_image: response
            .annotated_image
            .as_deref()
            .and_then(normalize_image_url),
    })
}

/// Classification service seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Submit whichever parts of the bundle are present
    async fn submit(&self, bundle: &CaptureBundle) -> Result<Prediction, InferenceError>;
}

/// HTTP client for `POST /api/predict/multimodal`
pub struct HttpInferenceClient {
    client: reqwest::Client,
    url: String,
}

impl HttpInferenceClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, InferenceError> {
        Self::new(
            config.predict_url(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_form(bundle: &CaptureBundle) -> Result<Form, InferenceError> {
        let mut form = Form::new();

        if let Some(image) = &bundle.image {
            let part = Part::bytes(image.data.clone())
                .file_name("frame.jpg")
                .mime_str("image/jpeg")
                .map_err(|e| InferenceError::Network(e.to_string()))?;
            form = form.part("image", part);
        }

        if let Some(audio) = &bundle.audio {
            let part = Part::bytes(audio.data.clone())
                .file_name("sample.wav")
                .mime_str("audio/wav")
                .map_err(|e| InferenceError::Network(e.to_string()))?;
            form = form.part("audio", part);
        }

        Ok(form)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn submit(&self, bundle: &CaptureBundle) -> Result<Prediction, InferenceError> {
        debug!(
            "Submitting {:?} capture (image: {}, audio: {}) to {}",
            bundle.kind,
            bundle.image.is_some(),
            bundle.audio.is_some(),
            self.url
        );

        let form = Self::build_form(bundle)?;
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Inference request failed with status {}", status);
            return Err(InferenceError::ServerError(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        parse_prediction(&body)
    }
}
