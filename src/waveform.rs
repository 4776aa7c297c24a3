/// WAV encoding for captured audio clips
///
/// Clips are written as canonical RIFF/WAVE: mono, 16-bit signed PCM,
/// 44-byte header, at the capture device's native sample rate.

use crate::audio_buffer::AudioSample;
use crate::capture::CaptureError;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;

/// Encoded WAV clip ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub sample_count: usize,
}

impl WaveformBuffer {
    pub fn duration_secs(&self) -> f32 {
        self.sample_count as f32 / self.sample_rate as f32
    }
}

/// Decoded mono audio
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<AudioSample>,
    pub sample_rate: u32,
}

fn hound_error(e: hound::Error) -> CaptureError {
    CaptureError::Encoding(e.to_string())
}

/// Convert one sample to 16-bit PCM
///
/// Clamped to [-1, 1]; negatives scale by 32768, non-negatives by 32767.
pub fn quantize(sample: AudioSample) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Inverse of `quantize`
pub fn dequantize(value: i16) -> AudioSample {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Encode mono samples as a 16-bit PCM WAV file in memory
pub fn encode_wav(samples: &[AudioSample], sample_rate: u32) -> Result<WaveformBuffer, CaptureError> {
    if sample_rate == 0 {
        return Err(CaptureError::Encoding("sample rate must be > 0".to_string()));
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut data = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = WavWriter::new(Cursor::new(&mut data), spec).map_err(hound_error)?;
        for &sample in samples {
            writer.write_sample(quantize(sample)).map_err(hound_error)?;
        }
        writer.finalize().map_err(hound_error)?;
    }

    debug!(
        "Encoded {} samples at {} Hz into {} bytes",
        samples.len(),
        sample_rate,
        data.len()
    );

    Ok(WaveformBuffer {
        data,
        sample_rate,
        sample_count: samples.len(),
    })
}

fn read_mono<R: Read>(reader: WavReader<R>) -> Result<DecodedAudio, CaptureError> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<AudioSample> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(dequantize))
            .collect::<Result<_, _>>()
            .map_err(hound_error)?,
        (SampleFormat::Int, bits) if bits <= 32 => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(hound_error)?
        }
        (SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(hound_error)?,
        (format, bits) => {
            return Err(CaptureError::Encoding(format!(
                "unsupported WAV format: {:?} {} bit",
                format, bits
            )))
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode an in-memory WAV file to mono f32 samples
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, CaptureError> {
    let reader = WavReader::new(Cursor::new(bytes)).map_err(hound_error)?;
    read_mono(reader)
}

/// Read a WAV file from disk as mono f32 samples
pub fn read_wav_file(path: &Path) -> Result<DecodedAudio, CaptureError> {
    let reader = WavReader::open(path).map_err(hound_error)?;
    read_mono(reader)
}
