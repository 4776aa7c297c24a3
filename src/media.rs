/// Media source manager
///
/// Acquires the camera and microphone tracks as one `MediaSession`, exposes the
/// live frame and audio node, and guarantees the tracks are released on every
/// exit path. Platform specifics live behind `MediaBackend`.

use crate::audio_buffer::AudioTap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio node unavailable: {0}")]
    TapUnavailable(String),
}

/// Raw RGB frame from the video output
pub type VideoFrame = image::RgbImage;

/// Live camera track
pub trait VideoTrack: Send + Sync {
    /// Latest frame, or `None` while the stream is still warming up
    fn current_frame(&self) -> Option<VideoFrame>;

    fn is_live(&self) -> bool;

    fn stop(&self);

    fn label(&self) -> String;
}

/// Live microphone track
///
/// Once connected, the platform callback pushes fixed-size buffers into the tap
/// on its own schedule.
pub trait AudioTrack: Send + Sync {
    /// Native sample rate of the capture device
    fn sample_rate(&self) -> u32;

    fn connect(&self, tap: Arc<AudioTap>) -> Result<(), MediaError>;

    /// Stop delivering buffers (idempotent)
    fn disconnect(&self);

    fn is_live(&self) -> bool;

    fn stop(&self);
}

/// Platform media acquisition
pub trait MediaBackend: Send + Sync {
    fn open_video(&self) -> Result<Box<dyn VideoTrack>, MediaError>;

    fn open_audio(&self) -> Result<Box<dyn AudioTrack>, MediaError>;
}

impl<T: VideoTrack + ?Sized> VideoTrack for Arc<T> {
    fn current_frame(&self) -> Option<VideoFrame> {
        (**self).current_frame()
    }

    fn is_live(&self) -> bool {
        (**self).is_live()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

impl<T: AudioTrack + ?Sized> AudioTrack for Arc<T> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn connect(&self, tap: Arc<AudioTap>) -> Result<(), MediaError> {
        (**self).connect(tap)
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }

    fn is_live(&self) -> bool {
        (**self).is_live()
    }

    fn stop(&self) {
        (**self).stop()
    }
}

/// Stops a video track unless disarmed; covers failure after partial acquisition
struct VideoReleaseGuard {
    video: Arc<dyn VideoTrack>,
    armed: bool,
}

impl VideoReleaseGuard {
    fn new(video: Arc<dyn VideoTrack>) -> Self {
        Self { video, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for VideoReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Releasing video track after failed acquisition");
            self.video.stop();
        }
    }
}

/// One acquired camera + microphone pair
pub struct MediaSession {
    video: Arc<dyn VideoTrack>,
    audio: Arc<dyn AudioTrack>,
    released: AtomicBool,
}

impl MediaSession {
    pub fn video(&self) -> Arc<dyn VideoTrack> {
        self.video.clone()
    }

    pub fn audio(&self) -> Arc<dyn AudioTrack> {
        self.audio.clone()
    }

    /// Build the live audio node and connect it to the microphone
    pub fn attach_audio_tap(&self) -> Result<Arc<AudioTap>, MediaError> {
        let tap = AudioTap::new(self.audio.sample_rate())
            .map_err(|e| MediaError::TapUnavailable(e.to_string()))?;
        let tap = Arc::new(tap);

        self.audio
            .connect(tap.clone())
            .map_err(|e| MediaError::TapUnavailable(e.to_string()))?;

        debug!("Audio tap connected at {} Hz", tap.sample_rate());
        Ok(tap)
    }

    /// Disconnect the audio node only
    pub fn detach_audio_tap(&self) {
        self.audio.disconnect();
    }

    pub fn is_live(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.video.is_live()
    }

    /// Release all tracks; safe to call more than once
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.audio.disconnect();
        self.audio.stop();
        self.video.stop();
        info!("Media session released");
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owner of the single live `MediaSession`
pub struct MediaSourceManager {
    backend: Arc<dyn MediaBackend>,
    session: Mutex<Option<Arc<MediaSession>>>,
}

impl MediaSourceManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            session: Mutex::new(None),
        }
    }

    /// Acquire camera and microphone
    ///
    /// Returns the current session if one is already live. If the microphone
    /// fails after the camera was opened, the camera is released before the
    /// error is returned.
    pub fn start(&self) -> Result<Arc<MediaSession>, MediaError> {
        let mut slot = self.session.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.is_live() {
                debug!("Media session already live");
                return Ok(existing.clone());
            }
            existing.release();
        }

        info!("Acquiring camera and microphone...");
        let video: Arc<dyn VideoTrack> = Arc::from(self.backend.open_video()?);
        let guard = VideoReleaseGuard::new(video.clone());

        let audio: Arc<dyn AudioTrack> = Arc::from(self.backend.open_audio()?);
        guard.disarm();

        info!(
            "Media session started: {} + microphone at {} Hz",
            video.label(),
            audio.sample_rate()
        );

        let session = Arc::new(MediaSession {
            video,
            audio,
            released: AtomicBool::new(false),
        });
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Release the live session, if any
    pub fn stop(&self) {
        if let Some(session) = self.session.lock().take() {
            session.release();
        }
    }

    pub fn session(&self) -> Option<Arc<MediaSession>> {
        self.session.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.is_live())
            .unwrap_or(false)
    }
}

impl Drop for MediaSourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FeedBackend;

    #[test]
    fn test_start_and_stop() {
        let backend = Arc::new(FeedBackend::new(16000));
        let manager = MediaSourceManager::new(backend.clone());

        let session = manager.start().unwrap();
        assert!(session.is_live());
        assert!(backend.video().is_live());
        assert!(backend.audio().is_live());

        manager.stop();
        assert!(!session.is_live());
        assert!(!backend.video().is_live());
        assert!(!backend.audio().is_live());
        assert!(manager.session().is_none());

        // Idempotent
        manager.stop();
    }

    #[test]
    fn test_at_most_one_session() {
        let backend = Arc::new(FeedBackend::new(16000));
        let manager = MediaSourceManager::new(backend);

        let first = manager.start().unwrap();
        let second = manager.start().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_permission_denied() {
        let backend = Arc::new(FeedBackend::new(16000));
        backend.fail_video_with(MediaError::PermissionDenied("camera blocked".to_string()));
        let manager = MediaSourceManager::new(backend);

        assert_eq!(
            manager.start().err(),
            Some(MediaError::PermissionDenied("camera blocked".to_string()))
        );
        assert!(!manager.is_active());
    }

    #[test]
    fn test_partial_acquisition_releases_video() {
        let backend = Arc::new(FeedBackend::new(16000));
        backend.fail_audio_with(MediaError::DeviceUnavailable("no microphone".to_string()));
        let manager = MediaSourceManager::new(backend.clone());

        assert!(matches!(manager.start(), Err(MediaError::DeviceUnavailable(_))));
        assert!(!backend.video().is_live());
        assert!(manager.session().is_none());
    }

    #[test]
    fn test_audio_tap_receives_buffers() {
        let backend = Arc::new(FeedBackend::new(22050));
        let manager = MediaSourceManager::new(backend.clone());
        let session = manager.start().unwrap();

        let tap = session.attach_audio_tap().unwrap();
        assert_eq!(tap.sample_rate(), 22050);

        backend.audio().push_buffer(&[0.1; 512]);
        assert_eq!(tap.chunk_count(), 1);

        session.detach_audio_tap();
        backend.audio().push_buffer(&[0.1; 512]);
        assert_eq!(tap.chunk_count(), 1);
    }

    #[test]
    fn test_tap_failure_is_reported() {
        let backend = Arc::new(FeedBackend::new(16000));
        backend.audio().fail_connect(true);
        let manager = MediaSourceManager::new(backend);
        let session = manager.start().unwrap();

        assert!(matches!(
            session.attach_audio_tap(),
            Err(MediaError::TapUnavailable(_))
        ));
        assert!(session.is_live());
    }
}
