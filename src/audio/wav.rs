//! WAV conversion for the history service
//!
//! Audio on the history wire is always WAV, 16-bit PCM: user utterances
//! arrive as float32 PCM bytes, assistant turns as the Opus frames that were
//! sent to the device.

use std::io::Cursor;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::codec::OpusFrameDecoder;

fn spec(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Encode interleaved f32 samples as a 16-bit PCM WAV blob.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec(sample_rate, channels))
            .context("Failed to create WAV writer")?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(v).context("Failed to write WAV sample")?;
        }
        writer.finalize().context("Failed to finalize WAV")?;
    }
    Ok(cursor.into_inner())
}

/// Reinterpret little-endian float32 PCM bytes as samples.
pub fn pcm_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize f32 samples to little-endian bytes (the inverse of
/// [`pcm_bytes_to_f32`]).
pub fn f32_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode a sequence of Opus frames and package the PCM as WAV.
pub fn opus_frames_to_wav(frames: &[Vec<u8>], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let mut decoder = OpusFrameDecoder::new(sample_rate, channels)?;
    let mut samples = Vec::new();
    for frame in frames {
        samples.extend(decoder.decode(frame)?);
    }
    pcm_f32_to_wav(&samples, sample_rate, channels)
}

/// Parse a 16-bit PCM WAV blob back to f32 samples.
pub fn wav_to_pcm_f32(wav: &[u8]) -> Result<(Vec<f32>, u32, u16)> {
    let mut reader = WavReader::new(Cursor::new(wav)).context("Failed to parse WAV")?;
    let spec = reader.spec();
    let samples: Result<Vec<f32>, _> = match spec.sample_format {
        SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect(),
        SampleFormat::Float => reader.samples::<f32>().collect(),
    };
    Ok((
        samples.context("Failed to read WAV samples")?,
        spec.sample_rate,
        spec.channels,
    ))
}
