//! Audio codec bridge
//!
//! Everything between the device's encoded frames and the pipeline's float
//! PCM: per-session Opus decode/encode, WAV conversion for the history
//! service, and re-encoding of MP3/PCM provider output into paced Opus
//! frames.

pub mod codec;
pub mod stream;
pub mod wav;

pub use codec::{OpusFrameDecoder, OpusFrameEncoder};
pub use stream::OpusReencoder;

/// Linear resampler. Good enough for speech-band conversions between
/// provider and device rates.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Average interleaved stereo down to mono. Mono input passes through.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}
