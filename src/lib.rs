/// SmartBin detector library
///
/// Real-time multimodal detection-trigger engine: samples a live camera and
/// microphone, decides when a deposit plausibly happened, captures an image
/// and audio clip, submits them for classification, and drives the
/// confirmation workflow.

pub mod analyzer;
pub mod audio_buffer;
pub mod capture;
pub mod config;
pub mod engine;
pub mod inference;
pub mod media;
#[cfg(feature = "microphone")]
pub mod microphone;
pub mod sources;
pub mod state;
pub mod surface;
pub mod trigger;
pub mod waveform;

pub use analyzer::{rms, AnalyzerReading, LoudnessSample, NoiseBaseline, RollingAudioAnalyzer};
pub use audio_buffer::{AudioBufferError, AudioSample, AudioTap};
pub use capture::{capture_bundle, CaptureBundle, CaptureError, EncodedImage};
pub use config::{ConfigError, EngineConfig, ThresholdCell};
pub use engine::{DetectionEngine, EngineError};
pub use inference::{
    HttpInferenceClient, InferenceClient, InferenceError, ModalityOutcome, Prediction,
};
pub use media::{
    AudioTrack, MediaBackend, MediaError, MediaSession, MediaSourceManager, VideoFrame,
    VideoTrack,
};
pub use sources::{AudioSource, FeedBackend, FileBackend};
pub use state::{DetectionResult, DetectionStateMachine, EngineState, ModalityLabel};
pub use surface::{EngineEvent, EngineStats, SessionSnapshot};
pub use trigger::{TriggerKind, TriggerPolicy};
pub use waveform::{decode_wav, encode_wav, WaveformBuffer};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartbin_detector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
