/// Concrete media backends
///
/// - `FeedBackend`: tracks fed by the caller (embedding hosts and tests)
/// - `FileBackend`: a still image as the camera and a WAV file (or the
///   microphone) as the audio input

use crate::audio_buffer::{AudioSample, AudioTap};
use crate::config::CALLBACK_BUFFER_SIZE;
use crate::media::{AudioTrack, MediaBackend, MediaError, VideoFrame, VideoTrack};
use crate::waveform::read_wav_file;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Video track showing whatever frame was pushed last
#[derive(Debug)]
pub struct FeedVideoTrack {
    frame: RwLock<Option<VideoFrame>>,
    live: AtomicBool,
}

impl FeedVideoTrack {
    pub fn new() -> Self {
        Self {
            frame: RwLock::new(None),
            live: AtomicBool::new(true),
        }
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        *self.frame.write() = Some(frame);
    }

    pub fn clear_frame(&self) {
        *self.frame.write() = None;
    }

    fn reopen(&self) {
        self.live.store(true, Ordering::Release);
    }
}

impl Default for FeedVideoTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoTrack for FeedVideoTrack {
    fn current_frame(&self) -> Option<VideoFrame> {
        if !self.is_live() {
            return None;
        }
        self.frame.read().clone()
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn label(&self) -> String {
        "feed camera".to_string()
    }
}

/// Audio track forwarding pushed buffers to the connected tap
pub struct FeedAudioTrack {
    sample_rate: u32,
    tap: Mutex<Option<Arc<AudioTap>>>,
    live: AtomicBool,
    fail_connect: AtomicBool,
}

impl FeedAudioTrack {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            tap: Mutex::new(None),
            live: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Deliver one callback buffer; dropped when no tap is connected
    pub fn push_buffer(&self, samples: &[AudioSample]) {
        if !self.is_live() {
            return;
        }
        if let Some(tap) = self.tap.lock().as_ref() {
            tap.push(samples);
        }
    }

    /// Make the next `connect` fail
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.tap.lock().is_some()
    }

    fn reopen(&self) {
        self.live.store(true, Ordering::Release);
    }
}

impl AudioTrack for FeedAudioTrack {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&self, tap: Arc<AudioTap>) -> Result<(), MediaError> {
        if self.fail_connect.load(Ordering::Acquire) {
            return Err(MediaError::TapUnavailable(
                "audio processing node rejected".to_string(),
            ));
        }
        *self.tap.lock() = Some(tap);
        Ok(())
    }

    fn disconnect(&self) {
        self.tap.lock().take();
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.disconnect();
        self.live.store(false, Ordering::Release);
    }
}

/// Backend handing out shared feed tracks
pub struct FeedBackend {
    video: Arc<FeedVideoTrack>,
    audio: Arc<FeedAudioTrack>,
    video_failure: Mutex<Option<MediaError>>,
    audio_failure: Mutex<Option<MediaError>>,
}

impl FeedBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            video: Arc::new(FeedVideoTrack::new()),
            audio: Arc::new(FeedAudioTrack::new(sample_rate)),
            video_failure: Mutex::new(None),
            audio_failure: Mutex::new(None),
        }
    }

    pub fn video(&self) -> Arc<FeedVideoTrack> {
        self.video.clone()
    }

    pub fn audio(&self) -> Arc<FeedAudioTrack> {
        self.audio.clone()
    }

    /// Make camera acquisition fail with `error`
    pub fn fail_video_with(&self, error: MediaError) {
        *self.video_failure.lock() = Some(error);
    }

    /// Make microphone acquisition fail with `error`
    pub fn fail_audio_with(&self, error: MediaError) {
        *self.audio_failure.lock() = Some(error);
    }
}

impl MediaBackend for FeedBackend {
    fn open_video(&self) -> Result<Box<dyn VideoTrack>, MediaError> {
        if let Some(error) = self.video_failure.lock().clone() {
            return Err(error);
        }
        self.video.reopen();
        Ok(Box::new(self.video.clone()))
    }

    fn open_audio(&self) -> Result<Box<dyn AudioTrack>, MediaError> {
        if let Some(error) = self.audio_failure.lock().clone() {
            return Err(error);
        }
        self.audio.reopen();
        Ok(Box::new(self.audio.clone()))
    }
}

fn io_media_error(path: &Path, e: &std::io::Error) -> MediaError {
    let message = format!("{}: {}", path.display(), e);
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => MediaError::PermissionDenied(message),
        _ => MediaError::DeviceUnavailable(message),
    }
}

/// Camera stand-in serving one still image
pub struct StillImageVideo {
    frame: VideoFrame,
    label: String,
    live: AtomicBool,
}

impl StillImageVideo {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let image = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(io) => io_media_error(path, &io),
            other => MediaError::DeviceUnavailable(format!("{}: {}", path.display(), other)),
        })?;

        Ok(Self {
            frame: image.to_rgb8(),
            label: path.display().to_string(),
            live: AtomicBool::new(true),
        })
    }
}

impl VideoTrack for StillImageVideo {
    fn current_frame(&self) -> Option<VideoFrame> {
        self.is_live().then(|| self.frame.clone())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

struct Playback {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Microphone stand-in replaying a WAV file in real time, looping
pub struct WavFileAudio {
    samples: Arc<Vec<AudioSample>>,
    sample_rate: u32,
    playback: Mutex<Option<Playback>>,
    live: AtomicBool,
}

impl WavFileAudio {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        if let Err(e) = std::fs::metadata(path) {
            return Err(io_media_error(path, &e));
        }

        let decoded = read_wav_file(path)
            .map_err(|e| MediaError::DeviceUnavailable(format!("{}: {}", path.display(), e)))?;
        if decoded.samples.is_empty() {
            return Err(MediaError::DeviceUnavailable(format!(
                "{}: no audio samples",
                path.display()
            )));
        }

        info!(
            "Loaded {} samples at {} Hz from {}",
            decoded.samples.len(),
            decoded.sample_rate,
            path.display()
        );

        Ok(Self {
            samples: Arc::new(decoded.samples),
            sample_rate: decoded.sample_rate,
            playback: Mutex::new(None),
            live: AtomicBool::new(true),
        })
    }
}

impl AudioTrack for WavFileAudio {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&self, tap: Arc<AudioTap>) -> Result<(), MediaError> {
        if !self.is_live() {
            return Err(MediaError::TapUnavailable("track stopped".to_string()));
        }

        self.disconnect();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let samples = self.samples.clone();
        let buffer_period =
            Duration::from_secs_f64(CALLBACK_BUFFER_SIZE as f64 / self.sample_rate as f64);

        let handle = std::thread::Builder::new()
            .name("wav-playback".to_string())
            .spawn(move || {
                debug!("WAV playback started");
                let mut chunks = samples.chunks(CALLBACK_BUFFER_SIZE).cycle();
                while flag.load(Ordering::Acquire) {
                    if let Some(chunk) = chunks.next() {
                        tap.push(chunk);
                    }
                    std::thread::sleep(buffer_period);
                }
                debug!("WAV playback stopped");
            })
            .map_err(|e| MediaError::TapUnavailable(e.to_string()))?;

        *self.playback.lock() = Some(Playback { running, handle });
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(playback) = self.playback.lock().take() {
            playback.running.store(false, Ordering::Release);
            if playback.handle.join().is_err() {
                error!("WAV playback thread panicked");
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

/// Where `FileBackend` takes audio from
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    Wav(PathBuf),
    #[cfg(feature = "microphone")]
    Microphone,
}

/// Backend built from files on disk
pub struct FileBackend {
    image_path: PathBuf,
    audio: AudioSource,
}

impl FileBackend {
    pub fn new(image_path: impl Into<PathBuf>, audio: AudioSource) -> Self {
        Self {
            image_path: image_path.into(),
            audio,
        }
    }
}

impl MediaBackend for FileBackend {
    fn open_video(&self) -> Result<Box<dyn VideoTrack>, MediaError> {
        Ok(Box::new(StillImageVideo::open(&self.image_path)?))
    }

    fn open_audio(&self) -> Result<Box<dyn AudioTrack>, MediaError> {
        match &self.audio {
            AudioSource::Wav(path) => Ok(Box::new(WavFileAudio::open(path)?)),
            #[cfg(feature = "microphone")]
            AudioSource::Microphone => Ok(Box::new(crate::microphone::MicrophoneAudio::open()?)),
        }
    }
}
