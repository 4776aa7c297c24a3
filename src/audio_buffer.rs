/// Audio tap module for the live audio node
///
/// The platform audio callback pushes raw buffers into an `AudioTap`. The tap
/// keeps two views of that stream:
/// - a ring of the most recent buffers (60 by default) used for clip extraction
/// - the latest fixed-size analysis window used for loudness sampling
///
/// The callback is the only writer; the polling loop and capture step only read.

use crate::config::{ANALYSIS_WINDOW_SIZE, AUDIO_RING_CAPACITY};
use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace};

/// Audio sample format (f32 normalized to -1.0 to 1.0)
pub type AudioSample = f32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),

    #[error("Invalid sample rate: {0} Hz (must be > 0)")]
    InvalidSampleRate(u32),
}

type ChunkRing = HeapRb<Vec<AudioSample>>;

/// Shared sink fed by the audio callback
pub struct AudioTap {
    chunks: CachePadded<Mutex<ChunkRing>>,
    window: CachePadded<Mutex<VecDeque<AudioSample>>>,
    window_size: usize,
    sample_rate: u32,
}

impl AudioTap {
    /// Create a tap with the default ring capacity and analysis window
    pub fn new(sample_rate: u32) -> Result<Self, AudioBufferError> {
        Self::with_capacity(sample_rate, AUDIO_RING_CAPACITY, ANALYSIS_WINDOW_SIZE)
    }

    /// Create a tap with custom chunk capacity and window size
    pub fn with_capacity(
        sample_rate: u32,
        chunk_capacity: usize,
        window_size: usize,
    ) -> Result<Self, AudioBufferError> {
        if sample_rate == 0 {
            return Err(AudioBufferError::InvalidSampleRate(sample_rate));
        }
        if chunk_capacity == 0 {
            return Err(AudioBufferError::InvalidSize(chunk_capacity));
        }
        if window_size == 0 {
            return Err(AudioBufferError::InvalidSize(window_size));
        }

        debug!(
            "Creating audio tap: {} Hz, {} chunks, {} sample window",
            sample_rate, chunk_capacity, window_size
        );

        Ok(Self {
            chunks: CachePadded::new(Mutex::new(HeapRb::new(chunk_capacity))),
            window: CachePadded::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
            sample_rate,
        })
    }

    /// Append one callback buffer (non-blocking with respect to readers)
    ///
    /// When the ring is full the oldest chunk is evicted.
    pub fn push(&self, samples: &[AudioSample]) {
        if samples.is_empty() {
            return;
        }

        if let Some(evicted) = self.chunks.lock().push_overwrite(samples.to_vec()) {
            trace!("Evicted oldest chunk ({} samples)", evicted.len());
        }

        let mut window = self.window.lock();
        let tail = samples.len().min(self.window_size);
        window.extend(samples[samples.len() - tail..].iter().copied());
        let excess = window.len().saturating_sub(self.window_size);
        window.drain(..excess);

        trace!("Audio tap received {} samples", samples.len());
    }

    /// Copy of the latest analysis window (may be shorter while warming up)
    pub fn analysis_window(&self) -> Vec<AudioSample> {
        self.window.lock().iter().copied().collect()
    }

    /// Concatenate the last `max_chunks` buffers in chronological order
    pub fn recent_samples(&self, max_chunks: usize) -> Vec<AudioSample> {
        let ring = self.chunks.lock();
        let skip = ring.occupied_len().saturating_sub(max_chunks);
        let total: usize = ring.iter().skip(skip).map(Vec::len).sum();

        let mut samples = Vec::with_capacity(total);
        for chunk in ring.iter().skip(skip) {
            samples.extend_from_slice(chunk);
        }
        samples
    }

    /// Number of buffered chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().occupied_len()
    }

    /// Maximum number of buffered chunks
    pub fn capacity(&self) -> usize {
        self.chunks.lock().capacity().get()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count() == 0
    }

    /// Drop all buffered audio
    pub fn clear(&self) {
        let mut ring = self.chunks.lock();
        let occupied = ring.occupied_len();
        ring.skip(occupied);
        drop(ring);

        self.window.lock().clear();
        debug!("Cleared audio tap");
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Duration of audio currently buffered (in seconds)
    pub fn buffered_secs(&self) -> f32 {
        let ring = self.chunks.lock();
        let samples: usize = ring.iter().map(Vec::len).sum();
        samples as f32 / self.sample_rate as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tap_creation() {
        let tap = AudioTap::new(48000).unwrap();
        assert_eq!(tap.capacity(), AUDIO_RING_CAPACITY);
        assert_eq!(tap.window_size(), ANALYSIS_WINDOW_SIZE);
        assert_eq!(tap.sample_rate(), 48000);
        assert!(tap.is_empty());
    }

    #[test]
    fn test_invalid_sizes() {
        assert_eq!(
            AudioTap::new(0).err(),
            Some(AudioBufferError::InvalidSampleRate(0))
        );
        assert_eq!(
            AudioTap::with_capacity(16000, 0, 2048).err(),
            Some(AudioBufferError::InvalidSize(0))
        );
    }

    #[test]
    fn test_ring_evicts_oldest_chunk() {
        let tap = AudioTap::with_capacity(16000, 3, 8).unwrap();

        for value in 1..=5 {
            tap.push(&[value as f32; 4]);
        }

        assert_eq!(tap.chunk_count(), 3);
        let samples = tap.recent_samples(10);
        assert_eq!(samples.len(), 12);
        assert_relative_eq!(samples[0], 3.0);
        assert_relative_eq!(samples[11], 5.0);
    }

    #[test]
    fn test_recent_samples_chronological_order() {
        let tap = AudioTap::with_capacity(16000, 10, 8).unwrap();
        tap.push(&[0.1, 0.2]);
        tap.push(&[0.3]);
        tap.push(&[0.4, 0.5]);

        assert_eq!(tap.recent_samples(2), vec![0.3, 0.4, 0.5]);
        assert_eq!(tap.recent_samples(30), vec![0.1, 0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let tap = AudioTap::with_capacity(16000, 4, 4).unwrap();
        tap.push(&[1.0, 2.0, 3.0]);
        assert_eq!(tap.analysis_window(), vec![1.0, 2.0, 3.0]);

        tap.push(&[4.0, 5.0]);
        assert_eq!(tap.analysis_window(), vec![2.0, 3.0, 4.0, 5.0]);

        // A buffer larger than the window replaces it entirely
        tap.push(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(tap.analysis_window(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_empty_push_ignored() {
        let tap = AudioTap::new(16000).unwrap();
        tap.push(&[]);
        assert!(tap.is_empty());
        assert!(tap.analysis_window().is_empty());
    }

    #[test]
    fn test_clear() {
        let tap = AudioTap::new(16000).unwrap();
        tap.push(&[0.5; 4096]);
        assert_eq!(tap.chunk_count(), 1);

        tap.clear();
        assert!(tap.is_empty());
        assert!(tap.analysis_window().is_empty());
    }

    #[test]
    fn test_buffered_duration() {
        let tap = AudioTap::new(16000).unwrap();
        tap.push(&vec![0.0; 16000]);
        assert_relative_eq!(tap.buffered_secs(), 1.0, epsilon = 0.001);
    }
}
