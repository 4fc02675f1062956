//! Per-session Opus frame decoding and encoding.

use anyhow::{Context, Result};
use opus::{Application, Channels, Decoder, Encoder};

/// Largest frame Opus permits is 120 ms.
const MAX_FRAME_MS: usize = 120;

fn channels_of(count: u16) -> Channels {
    if count >= 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

/// Decodes one device's inbound Opus frames into float PCM.
///
/// Stateful: Opus decoders carry prediction state between frames, so each
/// session owns exactly one decoder per direction.
pub struct OpusFrameDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
}

impl OpusFrameDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let decoder = Decoder::new(sample_rate, channels_of(channels))
            .context("Failed to create Opus decoder")?;
        Ok(Self {
            decoder,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Decode one encoded frame to interleaved f32 PCM.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<f32>> {
        let max_samples =
            (self.sample_rate as usize * MAX_FRAME_MS / 1000) * self.channels as usize;
        let mut pcm = vec![0.0f32; max_samples];
        let samples_per_channel = self
            .decoder
            .decode_float(frame, &mut pcm, false)
            .context("Opus decode failed")?;
        pcm.truncate(samples_per_channel * self.channels as usize);
        Ok(pcm)
    }
}

/// Encodes float PCM into fixed-duration Opus frames.
pub struct OpusFrameEncoder {
    encoder: Encoder,
    channels: u16,
    /// Samples per channel in one frame.
    frame_samples: usize,
}

impl OpusFrameEncoder {
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Result<Self> {
        let encoder = Encoder::new(sample_rate, channels_of(channels), Application::Voip)
            .context("Failed to create Opus encoder")?;
        let frame_samples = (sample_rate as usize * frame_duration_ms as usize) / 1000;
        Ok(Self {
            encoder,
            channels,
            frame_samples,
        })
    }

    /// Samples per channel consumed per frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Encode exactly one frame's worth of interleaved PCM.
    pub fn encode_frame(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            pcm.len() == self.frame_samples * self.channels as usize,
            "encoder fed {} samples, frame needs {}",
            pcm.len(),
            self.frame_samples * self.channels as usize
        );
        let mut out = vec![0u8; 4000];
        let written = self
            .encoder
            .encode_float(pcm, &mut out)
            .context("Opus encode failed")?;
        out.truncate(written);
        Ok(out)
    }
}
