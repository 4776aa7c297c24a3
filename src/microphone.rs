/// Microphone input via cpal
///
/// The cpal stream is not `Send`, so a dedicated thread builds, plays and
/// drops it. The callback downmixes to mono and forwards fixed-size buffers
/// to the connected tap.

use crate::audio_buffer::{AudioSample, AudioTap};
use crate::config::CALLBACK_BUFFER_SIZE;
use crate::media::{AudioTrack, MediaError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Collects interleaved callback data into mono buffers of a fixed size
struct Chunker {
    tap: Arc<AudioTap>,
    channels: usize,
    pending: Vec<AudioSample>,
}

impl Chunker {
    fn new(tap: Arc<AudioTap>, channels: u16) -> Self {
        Self {
            tap,
            channels: channels.max(1) as usize,
            pending: Vec::with_capacity(CALLBACK_BUFFER_SIZE),
        }
    }

    fn feed(&mut self, interleaved: impl Iterator<Item = AudioSample>) {
        let mut frame_sum = 0.0;
        let mut in_frame = 0;

        for sample in interleaved {
            frame_sum += sample;
            in_frame += 1;
            if in_frame == self.channels {
                self.pending.push(frame_sum / self.channels as f32);
                frame_sum = 0.0;
                in_frame = 0;

                if self.pending.len() == CALLBACK_BUFFER_SIZE {
                    self.tap.push(&self.pending);
                    self.pending.clear();
                }
            }
        }
    }
}

struct CaptureThread {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Default input device
pub struct MicrophoneAudio {
    sample_rate: u32,
    capture: Mutex<Option<CaptureThread>>,
    live: AtomicBool,
}

fn default_device() -> Result<cpal::Device, MediaError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no input device available".to_string()))
}

impl MicrophoneAudio {
    pub fn open() -> Result<Self, MediaError> {
        let device = default_device()?;
        let config = device
            .default_input_config()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        info!(
            "Microphone: {} ({} Hz, {} channels)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate().0,
            config.channels()
        );

        Ok(Self {
            sample_rate: config.sample_rate().0,
            capture: Mutex::new(None),
            live: AtomicBool::new(true),
        })
    }

    fn run_stream(
        tap: Arc<AudioTap>,
        ready_tx: mpsc::Sender<Result<(), MediaError>>,
        stop_rx: mpsc::Receiver<()>,
    ) {
        let stream = match Self::build_stream(tap) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(e.to_string())));
            return;
        }

        let _ = ready_tx.send(Ok(()));
        debug!("Microphone stream playing");

        // Blocks until disconnect (or the track is dropped)
        let _ = stop_rx.recv();
        drop(stream);
        debug!("Microphone stream closed");
    }

    fn build_stream(tap: Arc<AudioTap>) -> Result<cpal::Stream, MediaError> {
        let device = default_device()?;
        let config = device
            .default_input_config()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        let err_fn = |err: cpal::StreamError| error!("Microphone stream error: {}", err);
        let mut chunker = Chunker::new(tap, config.channels());

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    chunker.feed(data.iter().copied());
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config.into(),
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    chunker.feed(data.iter().map(|&s| s as f32 / 32768.0));
                },
                err_fn,
                None,
            ),
            other => {
                return Err(MediaError::TapUnavailable(format!(
                    "unsupported sample format {:?}",
                    other
                )))
            }
        };

        stream.map_err(|e| MediaError::TapUnavailable(e.to_string()))
    }
}

impl AudioTrack for MicrophoneAudio {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&self, tap: Arc<AudioTap>) -> Result<(), MediaError> {
        self.disconnect();

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("microphone".to_string())
            .spawn(move || Self::run_stream(tap, ready_tx, stop_rx))
            .map_err(|e| MediaError::TapUnavailable(e.to_string()))?;

        let started = ready_rx
            .recv()
            .map_err(|_| MediaError::TapUnavailable("microphone thread exited".to_string()))
            .and_then(|result| result);

        match started {
            Ok(()) => {
                *self.capture.lock() = Some(CaptureThread { stop_tx, handle });
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn disconnect(&self) {
        if let Some(capture) = self.capture.lock().take() {
            let _ = capture.stop_tx.send(());
            if capture.handle.join().is_err() {
                error!("Microphone thread panicked");
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.disconnect();
        self.live.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_downmixes_and_splits() {
        let tap = Arc::new(AudioTap::new(48000).unwrap());
        let mut chunker = Chunker::new(tap.clone(), 2);

        let stereo: Vec<f32> = (0..CALLBACK_BUFFER_SIZE * 2 + 10)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.1 })
            .collect();
        chunker.feed(stereo.into_iter());

        assert_eq!(tap.chunk_count(), 1);
        let samples = tap.recent_samples(1);
        assert_eq!(samples.len(), CALLBACK_BUFFER_SIZE);
        assert!((samples[0] - 0.2).abs() < 1e-6);
        assert_eq!(chunker.pending.len(), 5);
    }
}
