/// Session surface
///
/// Read-only views handed to the presentation layer: the per-tick snapshot,
/// resolution events, and running statistics.

use crate::state::{DetectionResult, EngineState};
use crate::trigger::TriggerKind;
use serde::Serialize;
use std::sync::Arc;

/// Everything a presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: EngineState,
    pub status_label: String,
    pub is_running: bool,

    /// Camera and microphone acquired
    pub camera_ready: bool,
    /// Acquisition failure shown as a persistent banner
    pub camera_error: Option<String>,
    /// False when running in visual-only mode
    pub audio_available: bool,

    pub loudness: f32,
    pub baseline: Option<f32>,
    pub threshold: f32,
    pub effective_threshold: f32,

    pub visual_feed: String,
    pub audio_feed: String,
    pub audio_summary: String,
    pub detection: Option<DetectionResult>,
    pub annotated_image: Option<Arc<str>>,
    pub toast: Option<String>,
    pub last_error: Option<String>,

    pub is_frozen: bool,
    pub is_auto_saving: bool,
}

impl SessionSnapshot {
    /// Loudness meter fill in percent, scaled so the effective threshold sits at 50%
    pub fn meter_percent(&self) -> f32 {
        if self.effective_threshold <= 0.0 {
            return 0.0;
        }
        (self.loudness / self.effective_threshold * 50.0).clamp(0.0, 100.0)
    }

    pub fn awaiting_feedback(&self) -> bool {
        self.state == EngineState::WaitingForFeedback
    }
}

/// Notifications emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        from: EngineState,
        to: EngineState,
    },

    BaselineReady {
        baseline: f32,
    },

    TriggerFired {
        kind: TriggerKind,
        detection_id: u64,
    },

    CycleFailed {
        detection_id: u64,
        message: String,
    },

    /// High-confidence result saved after the dwell
    AutoSaved { result: DetectionResult },

    /// Low-confidence result accepted as-is
    Confirmed { result: DetectionResult },

    /// Result saved under a user-supplied label
    Corrected {
        result: DetectionResult,
        label: String,
    },
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub audio_triggers: u64,
    pub visual_triggers: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub cycles_aborted: u64,
    pub auto_saves: u64,
    pub confirmations: u64,
    pub corrections: u64,
    pub is_running: bool,
}

impl EngineStats {
    pub fn triggers(&self) -> u64 {
        self.audio_triggers + self.visual_triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ModalityLabel;

    fn snapshot(loudness: f32, effective: f32) -> SessionSnapshot {
        SessionSnapshot {
            state: EngineState::Monitoring,
            status_label: "MONITORING".to_string(),
            is_running: true,
            camera_ready: true,
            camera_error: None,
            audio_available: true,
            loudness,
            baseline: None,
            threshold: 0.1,
            effective_threshold: effective,
            visual_feed: String::new(),
            audio_feed: String::new(),
            audio_summary: "Silence".to_string(),
            detection: None,
            annotated_image: None,
            toast: None,
            last_error: None,
            is_frozen: false,
            is_auto_saving: false,
        }
    }

    #[test]
    fn test_meter_percent() {
        assert_eq!(snapshot(0.15, 0.3).meter_percent(), 25.0);
        assert_eq!(snapshot(0.3, 0.3).meter_percent(), 50.0);
        assert_eq!(snapshot(0.9, 0.3).meter_percent(), 100.0);
        assert_eq!(snapshot(0.5, 0.0).meter_percent(), 0.0);
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::Corrected {
            result: DetectionResult {
                visual: Some(ModalityLabel::new("can", 0.4)),
                audio: None,
                annotated_image: None,
                combined_confidence: 0.4,
                trigger: TriggerKind::VisualOnly,
            },
            label: "glass_bottle".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "corrected");
        assert_eq!(json["label"], "glass_bottle");
        assert_eq!(json["result"]["visual"]["label"], "can");
        assert_eq!(json["result"]["trigger"], "visual_only");
    }

    #[test]
    fn test_snapshot_state_serializes_screaming_case() {
        let mut snap = snapshot(0.0, 0.1);
        snap.state = EngineState::WaitingForFeedback;
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "WAITING_FOR_FEEDBACK");
        assert!(snap.awaiting_feedback());
    }
}
