//! Energy-based voice-activity detector
//!
//! RMS energy against an adaptive noise floor. The pipeline resets the
//! detector before each query window, so per-window state is limited to the
//! noise floor itself, which survives resets on purpose: it tracks the
//! room, not the utterance.

use anyhow::Result;

use super::VadProvider;
use crate::config::VadProviderConfig;

pub struct EnergyVad {
    /// Absolute RMS threshold floor.
    threshold: f32,
    /// Adaptive estimate of background energy.
    noise_floor: f32,
    adaptation_rate: f32,
}

impl EnergyVad {
    pub fn new(config: &VadProviderConfig) -> Self {
        Self {
            threshold: config.threshold,
            noise_floor: 1e-6,
            adaptation_rate: 0.05,
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl VadProvider for EnergyVad {
    fn reset(&mut self) {
        // Noise floor intentionally kept; only decision state would reset,
        // and the energy detector has none.
    }

    fn is_voice(&mut self, pcm: &[f32], _sample_rate: u32, frame_size: usize) -> Result<bool> {
        // Judge on the trailing frame of the window: the window exists to
        // give the detector context, the decision is about "now".
        let tail = if pcm.len() > frame_size {
            &pcm[pcm.len() - frame_size..]
        } else {
            pcm
        };
        let energy = Self::rms(tail);
        let effective = self.threshold.max(self.noise_floor * 3.0);
        let voiced = energy > effective;
        if !voiced {
            self.noise_floor = self.noise_floor * (1.0 - self.adaptation_rate)
                + energy * self.adaptation_rate;
        }
        Ok(voiced)
    }
}
