/// Detection state machine
///
/// Owns the engine state and the current detection result. Every other
/// component reads them through snapshots; only this machine writes them.
///
/// MONITORING -> DETECTING -> {WAITING_FOR_FEEDBACK | AUTO_SAVING} -> MONITORING,
/// with DETECTING -> ERROR on inference failure.

use crate::capture::EncodedImage;
use crate::config::AUTO_SAVE_THRESHOLD;
use crate::inference::{ModalityOutcome, Prediction};
use crate::trigger::TriggerKind;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VISUAL_FEED_IDLE: &str = "Waiting for object...";
pub const AUDIO_FEED_IDLE: &str = "Listening...";
pub const FEED_FAILED: &str = "Detection failed";

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Sampling and allowed to trigger
    Monitoring,

    /// A capture/inference cycle is in flight
    Detecting,

    /// Low-confidence result awaiting confirm/correct
    WaitingForFeedback,

    /// High-confidence result shown before automatic save
    AutoSaving,

    /// Last cycle failed; does not block the next trigger
    Error,
}

impl EngineState {
    /// Whether the trigger policy may fire in this state
    pub fn accepts_triggers(self) -> bool {
        matches!(self, EngineState::Monitoring | EngineState::Error)
    }

    pub fn is_frozen(self) -> bool {
        !self.accepts_triggers()
    }

    /// Human-readable status line
    pub fn status_label(self) -> &'static str {
        match self {
            EngineState::Monitoring => "MONITORING",
            EngineState::Detecting => "DETECTING...",
            EngineState::WaitingForFeedback => "WAITING FOR FEEDBACK",
            EngineState::AutoSaving => "AUTO-SAVING...",
            EngineState::Error => "ERROR",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_label())
    }
}

/// Confidence as a rounded percentage
pub fn percent(confidence: f32) -> i32 {
    (confidence * 100.0).round() as i32
}

/// Label reported for one modality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalityLabel {
    pub label: String,
    pub confidence: f32,
}

impl ModalityLabel {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// `"plastic_bottle (85%)"`
    pub fn summary(&self) -> String {
        format!("{} ({}%)", self.label, percent(self.confidence))
    }
}

/// Outcome of one successful detection cycle
///
/// `None` for a modality means nothing was detected there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub visual: Option<ModalityLabel>,
    pub audio: Option<ModalityLabel>,
    /// Shared with every snapshot showing it
    pub annotated_image: Option<Arc<str>>,
    pub combined_confidence: f32,
    pub trigger: TriggerKind,
}

/// Handle for one capture/inference cycle
///
/// Completions carrying a ticket that is no longer current are ignored.
#[derive(Debug, Clone)]
pub struct CycleTicket {
    pub id: u64,
    pub kind: TriggerKind,
    previous_state: EngineState,
    previous_visual_feed: String,
    previous_audio_feed: String,
}

/// What the engine must do after a prediction was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResolution {
    /// Nothing recognised; back to monitoring
    NothingDetected,

    /// Frozen until confirm/correct
    AwaitingFeedback,

    /// Frozen for the dwell, then saved
    AutoSave { detection_id: u64 },

    /// Session was reset while the request was outstanding
    Stale,
}

/// Single-writer owner of `EngineState` and `DetectionResult`
#[derive(Debug)]
pub struct DetectionStateMachine {
    state: EngineState,
    detection_id: u64,
    result: Option<DetectionResult>,
    annotated_image: Option<Arc<str>>,
    visual_feed: String,
    audio_feed: String,
    toast: Option<String>,
    last_error: Option<String>,
}

impl DetectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Monitoring,
            detection_id: 0,
            result: None,
            annotated_image: None,
            visual_feed: VISUAL_FEED_IDLE.to_string(),
            audio_feed: AUDIO_FEED_IDLE.to_string(),
            toast: None,
            last_error: None,
        }
    }

    fn transition(&mut self, to: EngineState) {
        if self.state != to {
            info!("State: {} -> {}", self.state, to);
            self.state = to;
        }
    }

    fn is_current(&self, ticket: &CycleTicket) -> bool {
        self.state == EngineState::Detecting && self.detection_id == ticket.id
    }

    /// Enter DETECTING for a fired trigger
    ///
    /// Returns `None` when the current state does not accept triggers.
    pub fn begin_detection(&mut self, kind: TriggerKind) -> Option<CycleTicket> {
        if !self.state.accepts_triggers() {
            warn!("Trigger ignored in state {}", self.state);
            return None;
        }

        self.detection_id += 1;
        let ticket = CycleTicket {
            id: self.detection_id,
            kind,
            previous_state: self.state,
            previous_visual_feed: self.visual_feed.clone(),
            previous_audio_feed: self.audio_feed.clone(),
        };

        self.transition(EngineState::Detecting);
        self.visual_feed = "Detecting...".to_string();
        if kind.includes_audio() {
            self.audio_feed = "Recording...".to_string();
        }

        Some(ticket)
    }

    /// Undo `begin_detection` when neither image nor audio could be captured
    ///
    /// Returns false for stale tickets.
    pub fn abort_cycle(&mut self, ticket: &CycleTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }

        debug!("Cycle {} aborted: empty capture", ticket.id);
        self.state = ticket.previous_state;
        self.visual_feed = ticket.previous_visual_feed.clone();
        self.audio_feed = ticket.previous_audio_feed.clone();
        true
    }

    /// Apply a successful prediction and pick the follow-up state
    pub fn apply_prediction(
        &mut self,
        ticket: &CycleTicket,
        prediction: &Prediction,
        captured_image: Option<&EncodedImage>,
    ) -> CycleResolution {
        if !self.is_current(ticket) {
            debug!("Dropping stale prediction for cycle {}", ticket.id);
            return CycleResolution::Stale;
        }

        self.last_error = None;
        self.annotated_image = prediction
            .annotated_image
            .as_deref()
            .map(Arc::<str>::from)
            .or_else(|| captured_image.map(|image| Arc::from(image.to_data_url())));

        let visual = match &prediction.visual {
            ModalityOutcome::Detected(label) => {
                self.visual_feed = label.summary();
                Some(label.clone())
            }
            ModalityOutcome::NotDetected => {
                self.visual_feed = "No object detected".to_string();
                None
            }
            ModalityOutcome::Failed(message) => {
                self.visual_feed = format!("Visual error: {}", message);
                None
            }
        };

        let audio = if ticket.kind.includes_audio() {
            match &prediction.audio {
                ModalityOutcome::Detected(label) => {
                    self.audio_feed = label.summary();
                    Some(label.clone())
                }
                ModalityOutcome::NotDetected => {
                    self.audio_feed = "No sound detected".to_string();
                    None
                }
                ModalityOutcome::Failed(message) => {
                    self.audio_feed = format!("Audio error: {}", message);
                    None
                }
            }
        } else {
            None
        };

        if visual.is_none() && audio.is_none() {
            self.result = None;
            self.transition(EngineState::Monitoring);
            return CycleResolution::NothingDetected;
        }

        let confidence = prediction.confidence;
        self.result = Some(DetectionResult {
            visual,
            audio,
            annotated_image: self.annotated_image.clone(),
            combined_confidence: confidence,
            trigger: ticket.kind,
        });

        if confidence >= AUTO_SAVE_THRESHOLD {
            self.transition(EngineState::AutoSaving);
            self.toast = Some(format!(
                "High confidence ({}%). Auto-saving...",
                percent(confidence)
            ));
            CycleResolution::AutoSave {
                detection_id: ticket.id,
            }
        } else {
            self.transition(EngineState::WaitingForFeedback);
            self.toast = Some("Low confidence. Please verify.".to_string());
            CycleResolution::AwaitingFeedback
        }
    }

    /// Record an inference failure; returns false for stale tickets
    pub fn fail(&mut self, ticket: &CycleTicket, message: &str) -> bool {
        if !self.is_current(ticket) {
            return false;
        }

        warn!("Detection cycle {} failed: {}", ticket.id, message);
        self.result = None;
        self.last_error = Some(message.to_string());
        self.visual_feed = FEED_FAILED.to_string();
        if ticket.kind.includes_audio() {
            self.audio_feed = FEED_FAILED.to_string();
        }
        self.transition(EngineState::Error);
        true
    }

    /// Complete the auto-save dwell for `detection_id`
    ///
    /// Returns the saved result, or `None` if the detection was already resolved.
    pub fn finish_auto_save(&mut self, detection_id: u64) -> Option<DetectionResult> {
        if self.state != EngineState::AutoSaving || self.detection_id != detection_id {
            return None;
        }
        self.reset(Some("Data saved automatically!"))
    }

    /// Clear the current result and re-arm triggering
    ///
    /// While a request is in flight only the display cache is cleared; the
    /// completion decides the next state.
    pub fn reset(&mut self, toast: Option<&str>) -> Option<DetectionResult> {
        if let Some(message) = toast {
            self.toast = Some(message.to_string());
        }

        let resolved = self.result.take();
        self.annotated_image = None;

        if self.state == EngineState::Detecting {
            debug!("Reset during detection; state left to the in-flight cycle");
        } else {
            self.transition(EngineState::Monitoring);
        }

        resolved
    }

    /// Return to a fresh session state (start/stop)
    pub fn reset_session(&mut self) {
        self.state = EngineState::Monitoring;
        self.result = None;
        self.annotated_image = None;
        self.visual_feed = VISUAL_FEED_IDLE.to_string();
        self.audio_feed = AUDIO_FEED_IDLE.to_string();
        self.toast = None;
        self.last_error = None;
    }

    pub fn dismiss_toast(&mut self) {
        self.toast = None;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn result(&self) -> Option<&DetectionResult> {
        self.result.as_ref()
    }

    pub fn annotated_image(&self) -> Option<Arc<str>> {
        self.annotated_image.clone()
    }

    pub fn visual_feed(&self) -> &str {
        &self.visual_feed
    }

    pub fn audio_feed(&self) -> &str {
        &self.audio_feed
    }

    pub fn toast(&self) -> Option<&str> {
        self.toast.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `"Silence"` unless the current result carries an audio label
    pub fn audio_summary(&self) -> String {
        self.result
            .as_ref()
            .and_then(|r| r.audio.as_ref())
            .map(ModalityLabel::summary)
            .unwrap_or_else(|| "Silence".to_string())
    }
}

impl Default for DetectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
