/// Engine configuration
///
/// Runtime-adjustable settings live in `EngineConfig`. The detection
/// parameters below are fixed and shared by every session.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::warn;

/// Loudness samples averaged into the noise baseline
pub const BASELINE_SAMPLE_COUNT: usize = 120;

/// Baseline scale applied when deriving the effective threshold
pub const BASELINE_MULTIPLIER: f32 = 2.5;

/// Minimum gap between two audio-triggered captures
pub const AUDIO_DEBOUNCE_MS: u64 = 3000;

/// Heartbeat interval for visual-only captures
pub const VISUAL_POLL_MS: u64 = 2500;

/// Combined confidence at or above which results are saved without review
pub const AUTO_SAVE_THRESHOLD: f32 = 0.70;

/// How long an auto-saved result stays on screen
pub const AUTO_SAVE_DWELL_MS: u64 = 2000;

/// Captured frames are downscaled to at most this width
pub const MAX_IMAGE_WIDTH: u32 = 640;

/// JPEG quality (0-100)
pub const JPEG_QUALITY: u8 = 80;

/// Raw audio chunks retained for clip extraction
pub const AUDIO_RING_CAPACITY: usize = 60;

/// Chunks assembled into one submitted clip
pub const CLIP_CHUNK_COUNT: usize = 30;

/// Samples per loudness analysis window
pub const ANALYSIS_WINDOW_SIZE: usize = 2048;

/// Samples per buffer delivered by the shipped audio sources
pub const CALLBACK_BUFFER_SIZE: usize = 4096;

/// Engine events held for the host before new ones are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 256;

pub const MIN_THRESHOLD: f32 = 0.05;
pub const MAX_THRESHOLD: f32 = 0.90;
pub const DEFAULT_THRESHOLD: f32 = 0.10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid API base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Tick interval must be between 1 and 1000 ms, got {0}")]
    InvalidTickInterval(u64),

    #[error("Request timeout must be greater than 0")]
    InvalidTimeout,

    #[error("Invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

/// Clamp a user threshold into the accepted slider range
pub fn clamp_threshold(value: f32) -> f32 {
    value.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Base trigger threshold shared between the UI and the polling loop
///
/// Stored as raw f32 bits so every tick reads the latest value without locking.
#[derive(Debug)]
pub struct ThresholdCell(AtomicU32);

impl ThresholdCell {
    pub fn new(value: f32) -> Self {
        let initial = if value.is_finite() {
            clamp_threshold(value)
        } else {
            DEFAULT_THRESHOLD
        };
        Self(AtomicU32::new(initial.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Store a new threshold, returning the clamped value actually applied
    pub fn set(&self, value: f32) -> f32 {
        if !value.is_finite() {
            warn!("Ignoring non-finite threshold {}", value);
            return self.get();
        }

        let clamped = clamp_threshold(value);
        self.0.store(clamped.to_bits(), Ordering::Release);
        clamped
    }
}

impl Default for ThresholdCell {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

/// Runtime configuration for the detection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the inference service
    pub api_base_url: String,

    /// Polling loop cadence (display frame interval)
    pub tick_interval_ms: u64,

    /// Per-request timeout for inference calls
    pub request_timeout_secs: u64,

    /// Base threshold applied at startup
    pub initial_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            tick_interval_ms: 16, // ~60 fps
            request_timeout_secs: 30,
            initial_threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.api_base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.api_base_url.clone()));
        }

        if self.tick_interval_ms == 0 || self.tick_interval_ms > 1000 {
            return Err(ConfigError::InvalidTickInterval(self.tick_interval_ms));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(())
    }

    /// Load configuration from `SMARTBIN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SMARTBIN_API_BASE_URL") {
            config.api_base_url = url;
        }

        if let Ok(raw) = std::env::var("SMARTBIN_TICK_INTERVAL_MS") {
            config.tick_interval_ms = raw
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("SMARTBIN_TICK_INTERVAL_MS", raw))?;
        }

        if let Ok(raw) = std::env::var("SMARTBIN_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = raw
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("SMARTBIN_REQUEST_TIMEOUT_SECS", raw))?;
        }

        if let Ok(raw) = std::env::var("SMARTBIN_THRESHOLD") {
            config.initial_threshold = raw
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("SMARTBIN_THRESHOLD", raw))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Full URL of the multimodal prediction endpoint
    pub fn predict_url(&self) -> String {
        format!(
            "{}/api/predict/multimodal",
            self.api_base_url.trim().trim_end_matches('/')
        )
    }
}
