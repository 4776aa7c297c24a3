/// Adaptive trigger policy
///
/// Decides on every polling tick whether to fire an audio+visual capture, a
/// visual-only heartbeat capture, or nothing. Audio triggers preempt and reset
/// the visual poll clock.

use crate::analyzer::LoudnessSample;
use crate::config::{AUDIO_DEBOUNCE_MS, BASELINE_MULTIPLIER, VISUAL_POLL_MS};
use crate::state::EngineState;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Kind of capture a trigger requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Loudness spike: image plus the recent audio clip
    AudioVisual,

    /// Periodic heartbeat: image only
    VisualOnly,
}

impl TriggerKind {
    pub fn includes_audio(self) -> bool {
        matches!(self, TriggerKind::AudioVisual)
    }
}

/// Effective trigger threshold: `max(base, baseline × 2.5)`
///
/// An uncalibrated baseline counts as 0.
pub fn effective_threshold(base_threshold: f32, baseline: Option<f32>) -> f32 {
    base_threshold.max(baseline.unwrap_or(0.0) * BASELINE_MULTIPLIER)
}

/// Last trigger timestamps; `None` means never fired this session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriggerClock {
    pub last_audio_trigger: Option<Instant>,
    pub last_visual_poll: Option<Instant>,
}

impl TriggerClock {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn elapsed_beyond(last: Option<Instant>, now: Instant, limit: Duration) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) > limit,
        None => true,
    }
}

/// Inputs sampled by the polling loop for one decision
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub loudness: LoudnessSample,
    pub baseline: Option<f32>,
    pub base_threshold: f32,
    pub state: EngineState,
}

/// Trigger policy with its debounce clock
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    clock: TriggerClock,
    audio_debounce: Duration,
    visual_poll: Duration,
}

impl TriggerPolicy {
    pub fn new() -> Self {
        Self {
            clock: TriggerClock::default(),
            audio_debounce: Duration::from_millis(AUDIO_DEBOUNCE_MS),
            visual_poll: Duration::from_millis(VISUAL_POLL_MS),
        }
    }

    /// Evaluate one tick; updates the clock only when a trigger fires
    ///
    /// Frozen states never fire. The caller must already hold the in-flight flag.
    pub fn evaluate(&mut self, input: &PolicyInput, now: Instant) -> Option<TriggerKind> {
        if !input.state.accepts_triggers() {
            return None;
        }

        let threshold = effective_threshold(input.base_threshold, input.baseline);

        if input.loudness >= threshold
            && elapsed_beyond(self.clock.last_audio_trigger, now, self.audio_debounce)
        {
            self.clock.last_audio_trigger = Some(now);
            self.clock.last_visual_poll = Some(now);
            debug!(
                "Audio trigger: loudness {:.3} >= threshold {:.3}",
                input.loudness, threshold
            );
            return Some(TriggerKind::AudioVisual);
        }

        if elapsed_beyond(self.clock.last_visual_poll, now, self.visual_poll) {
            self.clock.last_visual_poll = Some(now);
            debug!("Visual poll trigger");
            return Some(TriggerKind::VisualOnly);
        }

        None
    }

    pub fn clock(&self) -> &TriggerClock {
        &self.clock
    }

    /// Forget both timestamps (session restart)
    pub fn reset(&mut self) {
        self.clock.reset();
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    fn input(loudness: f32, state: EngineState) -> PolicyInput {
        PolicyInput {
            loudness,
            baseline: Some(0.12), // effective threshold 0.3
            base_threshold: 0.1,
            state,
        }
    }

    fn at(origin: Instant, ms: u64) -> Instant {
        origin + Duration::from_millis(ms)
    }

    #[test_case(0.1, None, 0.1 ; "uncalibrated baseline uses base")]
    #[test_case(0.1, Some(0.02), 0.1 ; "quiet room keeps base")]
    #[test_case(0.1, Some(0.12), 0.3 ; "noisy room raises threshold")]
    #[test_case(0.5, Some(0.12), 0.5 ; "high base dominates")]
    fn test_effective_threshold(base: f32, baseline: Option<f32>, expected: f32) {
        assert_relative_eq!(effective_threshold(base, baseline), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_effective_threshold_monotonic() {
        let bases = [0.05, 0.1, 0.2, 0.5, 0.9];
        let baselines = [0.0, 0.01, 0.05, 0.1, 0.3];

        for pair in bases.windows(2) {
            for &b in &baselines {
                assert!(effective_threshold(pair[0], Some(b)) <= effective_threshold(pair[1], Some(b)));
            }
        }
        for pair in baselines.windows(2) {
            for &t in &bases {
                assert!(effective_threshold(t, Some(pair[0])) <= effective_threshold(t, Some(pair[1])));
            }
        }
    }

    #[test]
    fn test_quiet_input_polls_visual_every_interval() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();
        let mut fired = Vec::new();

        // 16ms ticks over 6 seconds of silence
        for ms in (0..6000).step_by(16) {
            if let Some(kind) = policy.evaluate(&input(0.01, EngineState::Monitoring), at(origin, ms)) {
                fired.push((ms, kind));
            }
        }

        assert!(fired.iter().all(|(_, kind)| *kind == TriggerKind::VisualOnly));
        assert_eq!(fired.first().map(|f| f.0), Some(0));

        // Exactly one capture inside any 2500ms window
        let in_first_window = fired.iter().filter(|(ms, _)| *ms <= 2500).count();
        assert_eq!(in_first_window, 1);
        assert!(fired[1].0 > 2500 && fired[1].0 <= 2516);
    }

    #[test]
    fn test_audio_spike_debounce() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();

        let first = policy.evaluate(&input(0.5, EngineState::Monitoring), at(origin, 0));
        assert_eq!(first, Some(TriggerKind::AudioVisual));

        let second = policy.evaluate(&input(0.5, EngineState::Monitoring), at(origin, 1000));
        assert_eq!(second, None);

        let third = policy.evaluate(&input(0.5, EngineState::Monitoring), at(origin, 3100));
        assert_eq!(third, Some(TriggerKind::AudioVisual));
    }

    #[test]
    fn test_audio_trigger_resets_visual_clock() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();

        policy.evaluate(&input(0.5, EngineState::Monitoring), at(origin, 0));
        assert_eq!(policy.clock().last_visual_poll, Some(at(origin, 0)));

        // No redundant visual capture right after an audio one
        assert_eq!(policy.evaluate(&input(0.0, EngineState::Monitoring), at(origin, 2400)), None);
        assert_eq!(
            policy.evaluate(&input(0.0, EngineState::Monitoring), at(origin, 2600)),
            Some(TriggerKind::VisualOnly)
        );
    }

    #[test]
    fn test_visual_trigger_leaves_audio_clock() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();

        assert_eq!(
            policy.evaluate(&input(0.0, EngineState::Monitoring), at(origin, 0)),
            Some(TriggerKind::VisualOnly)
        );
        assert_eq!(policy.clock().last_audio_trigger, None);

        // Audio may still fire immediately after a visual poll
        assert_eq!(
            policy.evaluate(&input(0.4, EngineState::Monitoring), at(origin, 10)),
            Some(TriggerKind::AudioVisual)
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();
        let exact = PolicyInput {
            loudness: 0.25,
            baseline: None,
            base_threshold: 0.25,
            state: EngineState::Monitoring,
        };
        assert_eq!(policy.evaluate(&exact, origin), Some(TriggerKind::AudioVisual));
    }

    #[test_case(EngineState::Detecting ; "detecting")]
    #[test_case(EngineState::WaitingForFeedback ; "waiting for feedback")]
    #[test_case(EngineState::AutoSaving ; "auto saving")]
    fn test_frozen_states_never_fire(state: EngineState) {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();

        for ms in (0..20_000).step_by(100) {
            assert_eq!(policy.evaluate(&input(0.9, state), at(origin, ms)), None);
        }
        assert_eq!(*policy.clock(), TriggerClock::default());
    }

    #[test]
    fn test_error_state_does_not_block() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();
        assert_eq!(
            policy.evaluate(&input(0.0, EngineState::Error), origin),
            Some(TriggerKind::VisualOnly)
        );
    }

    #[test]
    fn test_reset_clears_clock() {
        let origin = Instant::now();
        let mut policy = TriggerPolicy::new();
        policy.evaluate(&input(0.5, EngineState::Monitoring), origin);

        policy.reset();
        assert_eq!(*policy.clock(), TriggerClock::default());
        assert_eq!(
            policy.evaluate(&input(0.5, EngineState::Monitoring), at(origin, 10)),
            Some(TriggerKind::AudioVisual)
        );
    }
}
