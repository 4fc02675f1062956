//! TTS output transcoding
//!
//! Some TTS providers return MP3 or raw PCM rather than Opus. The
//! re-encoder turns whatever PCM falls out of them into Opus frames at the
//! session's negotiated output rate and frame duration, so the sender never
//! cares what the provider spoke.

use anyhow::{Context, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::codec::OpusFrameEncoder;
use super::{downmix_to_mono, resample_linear};
use crate::types::AudioFormat;

/// Decode a complete MP3 blob to mono f32 PCM and its source rate.
pub fn decode_mp3(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mss = MediaSourceStream::new(
        Box::new(std::io::Cursor::new(bytes.to_vec())),
        Default::default(),
    );
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Failed to probe MP3 stream")?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .context("MP3 stream has no audio track")?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create MP3 decoder")?;

    let mut samples = Vec::new();
    let mut rate = 0u32;
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let decoded_spec = *decoded.spec();
                rate = decoded_spec.rate;
                let channels = decoded_spec.channels.count() as u16;
                let mut buf =
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, decoded_spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend(downmix_to_mono(buf.samples(), channels));
            }
            // Skip over corrupt packets, keep the stream going.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::ensure!(rate > 0, "MP3 stream produced no audio");
    Ok((samples, rate))
}

/// Interpret raw little-endian s16 PCM bytes as mono f32 samples.
pub fn decode_pcm_s16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Incremental PCM → Opus frame re-encoder.
///
/// Accepts PCM at arbitrary source rates, resamples to the target format,
/// and emits complete frames as soon as enough samples accumulate. `finish`
/// pads the trailing partial frame with silence so the last syllable is not
/// swallowed.
pub struct OpusReencoder {
    encoder: OpusFrameEncoder,
    target: AudioFormat,
    pending: Vec<f32>,
}

impl OpusReencoder {
    pub fn new(target: AudioFormat) -> Result<Self> {
        Ok(Self {
            encoder: OpusFrameEncoder::new(
                target.sample_rate,
                target.channels,
                target.frame_duration_ms,
            )?,
            target,
            pending: Vec::new(),
        })
    }

    /// Feed mono PCM at `src_rate`, returning any frames now complete.
    pub fn push_pcm(&mut self, pcm: &[f32], src_rate: u32) -> Result<Vec<Vec<u8>>> {
        let resampled = resample_linear(pcm, src_rate, self.target.sample_rate);
        self.pending.extend(resampled);
        self.drain_complete_frames()
    }

    /// Flush the trailing partial frame (zero-padded).
    pub fn finish(&mut self) -> Result<Vec<Vec<u8>>> {
        let frame_len = self.encoder.frame_samples() * self.target.channels as usize;
        if !self.pending.is_empty() {
            self.pending.resize(self.pending.len().div_ceil(frame_len) * frame_len, 0.0);
        }
        self.drain_complete_frames()
    }

    fn drain_complete_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        let frame_len = self.encoder.frame_samples() * self.target.channels as usize;
        let mut frames = Vec::new();
        while self.pending.len() >= frame_len {
            let chunk: Vec<f32> = self.pending.drain(..frame_len).collect();
            frames.push(self.encoder.encode_frame(&chunk)?);
        }
        Ok(frames)
    }
}

/// One-shot helper: MP3 blob → Opus frames at the target format.
pub fn mp3_to_opus_frames(bytes: &[u8], target: AudioFormat) -> Result<Vec<Vec<u8>>> {
    let (pcm, rate) = decode_mp3(bytes)?;
    let mut reencoder = OpusReencoder::new(target)?;
    let mut frames = reencoder.push_pcm(&pcm, rate)?;
    frames.extend(reencoder.finish()?);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> AudioFormat {
        AudioFormat {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }

    #[test]
    fn test_reencoder_emits_complete_frames() {
        let mut r = OpusReencoder::new(target()).unwrap();
        // 25 ms at 16 kHz: one complete 20 ms frame, 5 ms pending.
        let pcm = vec![0.1f32; 400];
        let frames = r.push_pcm(&pcm, 16000).unwrap();
        assert_eq!(frames.len(), 1);
        let tail = r.finish().unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_reencoder_resamples_source_rate() {
        let mut r = OpusReencoder::new(target()).unwrap();
        // 20 ms at 48 kHz becomes 20 ms at 16 kHz: exactly one frame.
        let pcm = vec![0.0f32; 960];
        let frames = r.push_pcm(&pcm, 48000).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(r.finish().unwrap().is_empty());
    }

    #[test]
    fn test_decode_pcm_s16le() {
        let bytes = [0x00, 0x40, 0x00, 0xC0]; // +0.5, -0.5 approximately
        let samples = decode_pcm_s16le(&bytes);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 0.01);
        assert!((samples[1] + 0.5).abs() < 0.01);
    }

    #[test]
    fn test_finish_on_empty_is_empty() {
        let mut r = OpusReencoder::new(target()).unwrap();
        assert!(r.finish().unwrap().is_empty());
    }
}
