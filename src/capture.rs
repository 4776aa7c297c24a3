/// Capture and encode module
///
/// Snapshots the current video frame as a downscaled JPEG and the most recent
/// buffered audio as a WAV clip, producing one `CaptureBundle` per trigger.

use crate::audio_buffer::AudioTap;
use crate::config::{CLIP_CHUNK_COUNT, JPEG_QUALITY, MAX_IMAGE_WIDTH};
use crate::media::{VideoFrame, VideoTrack};
use crate::trigger::TriggerKind;
use crate::waveform::{encode_wav, WaveformBuffer};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::ColorType;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// JPEG-encoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose, Engine as _};
        general_purpose::STANDARD.encode(&self.data)
    }

    /// Data URL for direct display
    pub fn to_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.to_base64())
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Output size for a frame: width capped at 640, aspect ratio kept
pub fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    if width <= MAX_IMAGE_WIDTH {
        return (width, height);
    }

    let scale = MAX_IMAGE_WIDTH as f64 / width as f64;
    let scaled_height = (height as f64 * scale).round().max(1.0) as u32;
    (MAX_IMAGE_WIDTH, scaled_height)
}

/// Downscale and JPEG-encode one frame
///
/// Returns `None` while the stream has no frame dimensions yet.
pub fn encode_frame(frame: &VideoFrame) -> Result<Option<EncodedImage>, CaptureError> {
    let (src_width, src_height) = frame.dimensions();
    if src_width == 0 || src_height == 0 {
        return Ok(None);
    }

    let (width, height) = scaled_dimensions(src_width, src_height);
    let resized;
    let raster = if (width, height) == (src_width, src_height) {
        frame
    } else {
        resized = imageops::resize(frame, width, height, FilterType::Triangle);
        &resized
    };

    let mut data = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY);
    encoder
        .encode(raster.as_raw(), width, height, ColorType::Rgb8)
        .map_err(|e| CaptureError::Encoding(e.to_string()))?;

    debug!(
        "Encoded {}x{} frame ({}x{} source) into {} bytes",
        width,
        height,
        src_width,
        src_height,
        data.len()
    );

    Ok(Some(EncodedImage {
        data,
        width,
        height,
    }))
}

/// Grab and encode the track's current frame
pub fn capture_frame(video: &dyn VideoTrack) -> Result<Option<EncodedImage>, CaptureError> {
    match video.current_frame() {
        Some(frame) => encode_frame(&frame),
        None => Ok(None),
    }
}

/// Encode the last 30 buffered chunks as a WAV clip
///
/// Returns `None` when nothing has been buffered yet.
pub fn capture_audio_clip(tap: &AudioTap) -> Result<Option<WaveformBuffer>, CaptureError> {
    if tap.is_empty() {
        return Ok(None);
    }

    let samples = tap.recent_samples(CLIP_CHUNK_COUNT);
    if samples.is_empty() {
        return Ok(None);
    }

    let clip = encode_wav(&samples, tap.sample_rate())?;
    debug!("Captured {:.2}s audio clip", clip.duration_secs());
    Ok(Some(clip))
}

/// Evidence gathered for one detection attempt
#[derive(Debug, Clone)]
pub struct CaptureBundle {
    pub kind: TriggerKind,
    pub image: Option<EncodedImage>,
    pub audio: Option<WaveformBuffer>,
}

impl CaptureBundle {
    /// Nothing to submit; the cycle must be aborted
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.audio.is_none()
    }
}

/// Capture everything a trigger asks for
///
/// Encoding failures are logged and treated as a missing part.
pub fn capture_bundle(
    kind: TriggerKind,
    video: &dyn VideoTrack,
    tap: Option<&AudioTap>,
) -> CaptureBundle {
    let image = capture_frame(video).unwrap_or_else(|e| {
        warn!("Frame capture failed: {}", e);
        None
    });

    let audio = match tap {
        Some(tap) if kind.includes_audio() => capture_audio_clip(tap).unwrap_or_else(|e| {
            warn!("Audio clip capture failed: {}", e);
            None
        }),
        _ => None,
    };

    if kind.includes_audio() && image.is_none() && audio.is_some() {
        debug!("Video not ready; submitting audio only");
    }

    CaptureBundle { kind, image, audio }
}
