/// Rolling audio analyzer
///
/// Turns the live audio tap into a loudness (RMS) signal pulled at the polling
/// cadence, and calibrates a noise baseline from the first samples of a session.

use crate::audio_buffer::{AudioSample, AudioTap};
use crate::config::BASELINE_SAMPLE_COUNT;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// RMS loudness of one analysis window, in [0, 1]
pub type LoudnessSample = f32;

/// Root-mean-square of samples normalized to [-1, 1]
pub fn rms(samples: &[AudioSample]) -> LoudnessSample {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s.clamp(-1.0, 1.0) as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Ambient noise floor, averaged once per session
#[derive(Debug, Clone)]
pub struct NoiseBaseline {
    required: usize,
    sum: f64,
    count: usize,
    value: Option<f32>,
}

impl NoiseBaseline {
    pub fn new() -> Self {
        Self::with_sample_count(BASELINE_SAMPLE_COUNT)
    }

    pub fn with_sample_count(required: usize) -> Self {
        Self {
            required: required.max(1),
            sum: 0.0,
            count: 0,
            value: None,
        }
    }

    /// Feed one loudness sample
    ///
    /// Returns the baseline exactly once, on the sample that completes calibration.
    /// Samples after that are ignored.
    pub fn record(&mut self, sample: LoudnessSample) -> Option<f32> {
        if self.value.is_some() {
            return None;
        }

        self.sum += sample as f64;
        self.count += 1;

        if self.count >= self.required {
            let average = (self.sum / self.count as f64) as f32;
            self.value = Some(average);
            return Some(average);
        }

        None
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    pub fn samples_seen(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
        self.value = None;
    }
}

impl Default for NoiseBaseline {
    fn default() -> Self {
        Self::new()
    }
}

/// One polling-tick reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerReading {
    pub loudness: LoudnessSample,
    pub baseline: Option<f32>,
    /// Set on the tick where calibration completed
    pub baseline_ready: bool,
}

/// Loudness analyzer bound to one media session
pub struct RollingAudioAnalyzer {
    tap: Option<Arc<AudioTap>>,
    baseline: NoiseBaseline,
}

impl RollingAudioAnalyzer {
    pub fn new(tap: Arc<AudioTap>) -> Self {
        debug!("Audio analyzer attached ({} Hz)", tap.sample_rate());
        Self {
            tap: Some(tap),
            baseline: NoiseBaseline::new(),
        }
    }

    /// Analyzer for sessions whose audio node could not be built
    ///
    /// Loudness is always 0 and the baseline never becomes ready.
    pub fn visual_only() -> Self {
        Self {
            tap: None,
            baseline: NoiseBaseline::new(),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.tap.is_some()
    }

    /// Loudness of the latest analysis window
    pub fn sample_loudness(&self) -> LoudnessSample {
        match &self.tap {
            Some(tap) => rms(&tap.analysis_window()),
            None => 0.0,
        }
    }

    /// Sample loudness and advance baseline calibration
    pub fn tick(&mut self) -> AnalyzerReading {
        let loudness = self.sample_loudness();

        let baseline_ready = if self.tap.is_some() {
            match self.baseline.record(loudness) {
                Some(value) => {
                    info!("Noise baseline calibrated: {:.4}", value);
                    true
                }
                None => false,
            }
        } else {
            false
        };

        trace!("Loudness {:.4}, baseline {:?}", loudness, self.baseline.value());

        AnalyzerReading {
            loudness,
            baseline: self.baseline.value(),
            baseline_ready,
        }
    }

    pub fn baseline(&self) -> &NoiseBaseline {
        &self.baseline
    }

    pub fn tap(&self) -> Option<&Arc<AudioTap>> {
        self.tap.as_ref()
    }
}
