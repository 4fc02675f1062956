//! Voice-activity loop
//!
//! Consumes the device's Opus frames, decodes them, asks the pooled VAD
//! provider whether the user is speaking, and drives the silence/voice
//! timers: pre-roll hand-off into ASR on voice onset, utterance commit on
//! trailing silence, realtime barge-in on sustained voice, idle close when
//! nobody speaks for too long.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::asr::AsrManager;
use super::speaker::SpeakerManager;
use super::state::{ListenMode, SessionCore, SessionStatus, VadBuffer};
use super::tts::TtsManager;
use crate::audio::codec::OpusFrameDecoder;

/// Pre-roll retained ahead of voice onset, so utterance starts are not
/// clipped.
const PREROLL_MS: u32 = 200;
/// Continuous voice required to trigger realtime barge-in.
const BARGE_IN_VOICE_MS: u64 = 360;
/// Minimum voiced audio for a silence edge to count as an utterance end.
const MIN_UTTERANCE_VOICE_MS: u64 = 100;

pub struct VadLoop {
    pub core: Arc<SessionCore>,
    pub asr: Arc<AsrManager>,
    pub speaker: Arc<SpeakerManager>,
    pub tts: TtsManager,
}

impl VadLoop {
    pub fn spawn(self, opus_rx: mpsc::Receiver<Vec<u8>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(opus_rx))
    }

    async fn run(self, mut opus_rx: mpsc::Receiver<Vec<u8>>) {
        let core = self.core.clone();
        let token = core.session_token.clone();

        let input = *core.input_format.lock().unwrap();
        let mut decoder = match OpusFrameDecoder::new(input.sample_rate, input.channels) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to create session Opus decoder");
                core.close_notify.notify_one();
                return;
            }
        };

        let mut vad = match core.pools.vad.acquire(&core.device_config.vad).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "VAD acquire failed");
                core.close_notify.notify_one();
                return;
            }
        };

        let sample_rate = input.sample_rate;
        let min_window_samples =
            (sample_rate as usize * core.config.providers.vad.min_window_ms as usize) / 1000;
        let mut vad_buffer = VadBuffer::new(sample_rate, PREROLL_MS.max(
            core.config.providers.vad.min_window_ms,
        ));

        let max_idle_ms = core.config.chat.max_idle_duration_ms;
        let mut format_derived = false;
        let mut frame_ms: u64 = input.frame_duration_ms as u64;
        let mut frame_samples = input.samples_per_frame();

        // Utterance state.
        let mut client_have_voice = false;
        let mut continuous_voice_ms: u64 = 0;
        let mut utterance_voice_ms: u64 = 0;
        let mut silence_ms: u64 = 0;

        loop {
            let frame = tokio::select! {
                f = opus_rx.recv() => f,
                _ = token.cancelled() => break,
            };
            let Some(frame) = frame else { break };

            let mode = core.listen_mode();
            let realtime = mode == ListenMode::Realtime;
            if !core.listening.load(Ordering::Acquire) && !realtime {
                continue;
            }

            let pcm = match decoder.decode(&frame) {
                Ok(pcm) => pcm,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            // Frame geometry comes from the first decoded frame, so the
            // device need not pre-declare it; later changes are adapted to.
            let this_frame_samples = pcm.len() / input.channels.max(1) as usize;
            if !format_derived || this_frame_samples != frame_samples {
                frame_samples = this_frame_samples.max(1);
                frame_ms = (frame_samples as u64 * 1000) / sample_rate.max(1) as u64;
                if !format_derived {
                    core.input_format.lock().unwrap().frame_duration_ms = frame_ms as u32;
                    format_derived = true;
                } else {
                    debug!(frame_ms, "input frame size changed, adapting");
                }
            }

            // Manual-style windows run without VAD: every frame counts as
            // voice until the device closes the window.
            let vad_enabled = mode != ListenMode::Manual;
            let have_voice = if vad_enabled {
                vad_buffer.push(&pcm);
                if vad_buffer.len() < min_window_samples {
                    // Not enough context for a VAD call yet.
                    continue;
                }
                let window = vad_buffer.peek_last(min_window_samples);
                vad.get_mut().reset();
                match vad.get_mut().is_voice(&window, sample_rate, frame_samples) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "VAD query failed");
                        false
                    }
                }
            } else {
                true
            };

            if have_voice {
                silence_ms = 0;
                continuous_voice_ms += frame_ms;
                utterance_voice_ms += frame_ms;
                core.touch();

                if !client_have_voice {
                    client_have_voice = true;
                    self.speaker.start_utterance().await;
                    if !self.asr.input_open() {
                        if let Err(e) = self.asr.restart().await {
                            warn!(error = %e, "ASR restart on voice onset failed");
                        }
                    }
                    // Hand the pre-roll to ASR so onset audio is kept.
                    let lead = if vad_enabled {
                        vad_buffer.drain()
                    } else {
                        pcm.clone()
                    };
                    self.asr.add_pcm(&lead);
                    self.speaker.add_pcm(&lead);
                    debug!(lead_ms = lead.len() as u64 * 1000 / sample_rate as u64, "voice onset");
                } else {
                    self.asr.add_pcm(&pcm);
                    self.speaker.add_pcm(&pcm);
                }

                // Realtime barge-in: sustained voice interrupts the
                // assistant once per utterance.
                if realtime
                    && core.config.chat.realtime_mode == 1
                    && continuous_voice_ms > BARGE_IN_VOICE_MS
                    && !core.barge_latched.swap(true, Ordering::AcqRel)
                {
                    debug!(continuous_voice_ms, "VAD barge-in");
                    core.after_asr.cancel();
                    self.tts.interrupt_and_clear();
                }
            } else {
                silence_ms += frame_ms;
                continuous_voice_ms = 0;

                if client_have_voice && utterance_voice_ms > MIN_UTTERANCE_VOICE_MS {
                    self.on_voice_silence(&mut vad_buffer);
                    client_have_voice = false;
                    utterance_voice_ms = 0;
                }

                if silence_ms > max_idle_ms {
                    debug!(silence_ms, "idle budget exhausted, closing session");
                    core.close_notify.notify_one();
                    break;
                }
            }
        }

        core.pools.vad.release(vad);
        debug!("voice-activity loop stopped");
    }

    /// Trailing-silence edge: the utterance is over.
    fn on_voice_silence(&self, vad_buffer: &mut VadBuffer) {
        debug!("utterance silence edge");
        self.asr.stop_input();
        vad_buffer.drain();
        self.core.set_status(SessionStatus::ListenStop);
        self.core.barge_latched.store(false, Ordering::Release);
        self.speaker.finish_and_identify();
    }
}
