//! ASR lifecycle: restart, result loop, commit
//!
//! Drives a pooled streaming recognizer. The voice-activity loop feeds PCM
//! in; this manager owns the recognizer instance, re-arms it between
//! utterances (continuously in realtime mode), and commits final
//! hypotheses: user message + audio persisted one-shot, `asr_result` frame
//! sent, speaker verdict attached, text enqueued for the LLM.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::speaker::SpeakerManager;
use super::state::{SessionCore, SessionStatus, SpeakerResult};
use super::tts::TtsManager;
use crate::audio::wav::f32_to_pcm_bytes;
use crate::pool::Pooled;
use crate::providers::{AsrEvent, AsrProvider};
use crate::sync::BoundedQueue;
use crate::transport::ServerMessage;
use crate::types::{AudioData, Message};

/// Capacity of the per-utterance PCM feed into the recognizer.
const PCM_CHANNEL_CAP: usize = 100;
/// Capacity of the committed-text queue feeding the LLM dispatcher.
const CHAT_QUEUE_CAP: usize = 10;

/// A committed user utterance heading for the LLM.
pub struct ChatText {
    pub text: String,
    pub speaker: Option<SpeakerResult>,
}

pub struct AsrManager {
    core: Arc<SessionCore>,
    speaker: Arc<SpeakerManager>,
    tts: TtsManager,
    pub chat_queue: Arc<BoundedQueue<ChatText>>,
    pcm_tx: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    provider: tokio::sync::Mutex<Option<Pooled<Box<dyn AsrProvider>>>>,
    result_rx: tokio::sync::Mutex<Option<mpsc::Receiver<AsrEvent>>>,
    rx_ready: Notify,
}

impl AsrManager {
    pub fn new(core: Arc<SessionCore>, speaker: Arc<SpeakerManager>, tts: TtsManager) -> Arc<Self> {
        Arc::new(Self {
            core,
            speaker,
            tts,
            chat_queue: Arc::new(BoundedQueue::new(CHAT_QUEUE_CAP)),
            pcm_tx: Mutex::new(None),
            provider: tokio::sync::Mutex::new(None),
            result_rx: tokio::sync::Mutex::new(None),
            rx_ready: Notify::new(),
        })
    }

    /// Whether an utterance stream is currently accepting audio.
    pub fn input_open(&self) -> bool {
        self.pcm_tx.lock().unwrap().is_some()
    }

    /// Feed PCM into the recognizer and the utterance audio buffer.
    pub fn add_pcm(&self, pcm: &[f32]) {
        self.core.asr_audio.extend(pcm);
        let guard = self.pcm_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(pcm.to_vec()).is_err() {
                warn!("ASR PCM feed saturated, dropping chunk");
            }
        }
    }

    /// Close the utterance's audio feed; the provider finalizes.
    pub fn stop_input(&self) {
        self.pcm_tx.lock().unwrap().take();
    }

    /// Acquire (or reuse) a recognizer and arm a fresh utterance stream.
    ///
    /// A failed start releases the possibly-damaged instance and retries
    /// once with a fresh one.
    pub async fn restart(&self) -> Result<()> {
        let sample_rate = self.core.input_format.lock().unwrap().sample_rate;
        let mut guard = self.provider.lock().await;

        for attempt in 0..2 {
            if guard.is_none() {
                let wrapper = self
                    .core
                    .pools
                    .asr
                    .acquire(&self.core.device_config.asr)
                    .await
                    .context("ASR acquire failed")?;
                *guard = Some(wrapper);
            }

            let (pcm_tx, pcm_rx) = mpsc::channel(PCM_CHANNEL_CAP);
            let wrapper = guard.as_mut().expect("provider just ensured");
            match wrapper.get_mut().streaming_recognize(
                self.core.session_token.clone(),
                pcm_rx,
                sample_rate,
            ) {
                Ok(result_rx) => {
                    *self.pcm_tx.lock().unwrap() = Some(pcm_tx);
                    *self.result_rx.lock().await = Some(result_rx);
                    self.rx_ready.notify_one();
                    debug!(attempt, "ASR recognition armed");
                    return Ok(());
                }
                Err(e) if attempt == 0 => {
                    warn!(error = %e, "ASR start failed, discarding instance and retrying");
                    if let Some(bad) = guard.take() {
                        self.core.pools.asr.discard(bad);
                    }
                }
                Err(e) => return Err(e).context("ASR start failed twice"),
            }
        }
        unreachable!()
    }

    /// Return the recognizer to the pool between utterances.
    pub async fn release_provider(&self) {
        if let Some(wrapper) = self.provider.lock().await.take() {
            self.core.pools.asr.release(wrapper);
        }
    }

    /// Long-lived hypothesis consumer. `on_error` receives fatal failures;
    /// the caller closes the session from there.
    pub fn spawn_result_loop<F>(self: &Arc<Self>, on_error: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.result_loop(on_error).await;
        })
    }

    async fn result_loop<F>(self: Arc<Self>, on_error: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let token = self.core.session_token.clone();
        let max_idle = Duration::from_secs(self.core.config.chat.asr_max_idle_secs);
        let mut idle_since = Instant::now();
        // Latch so realtime_mode 4 interrupts once per utterance.
        let mut delta_interrupted = false;

        'outer: loop {
            let mut rx = loop {
                if let Some(rx) = self.result_rx.lock().await.take() {
                    break rx;
                }
                tokio::select! {
                    _ = self.rx_ready.notified() => {}
                    _ = token.cancelled() => return,
                }
            };

            loop {
                let event = tokio::select! {
                    e = rx.recv() => e,
                    _ = token.cancelled() => return,
                };
                let Some(event) = event else {
                    // Stream ended without a final result; treat as empty.
                    if self.handle_empty_final(&mut idle_since, max_idle, &on_error).await {
                        continue 'outer;
                    }
                    return;
                };

                if let Some(err) = event.error {
                    on_error(format!("ASR error: {}", err));
                    return;
                }

                if !event.is_final {
                    if !event.text.is_empty()
                        && !delta_interrupted
                        && self.core.is_realtime()
                        && self.core.config.chat.realtime_mode == 4
                    {
                        debug!("first ASR delta, interrupting current turn");
                        self.core.after_asr.cancel();
                        self.tts.interrupt_and_clear();
                        delta_interrupted = true;
                    }
                    continue;
                }

                delta_interrupted = false;
                let text = event.text.trim().to_string();
                if text.is_empty() {
                    if self.handle_empty_final(&mut idle_since, max_idle, &on_error).await {
                        continue 'outer;
                    }
                    return;
                }

                idle_since = Instant::now();
                self.commit_utterance(text).await;

                if self.core.is_realtime() {
                    // Keep listening continuously.
                    if let Err(e) = self.restart().await {
                        on_error(format!("ASR restart failed: {}", e));
                        return;
                    }
                    continue 'outer;
                }
                // One-shot listening window: hand the instance back.
                self.stop_input();
                self.release_provider().await;
                continue 'outer;
            }
        }
    }

    /// Empty-final policy: restart while the session is in a listening
    /// state and the idle budget holds; report failure otherwise.
    /// Returns true when the loop should continue with a fresh stream.
    async fn handle_empty_final<F>(
        &self,
        idle_since: &mut Instant,
        max_idle: Duration,
        on_error: &F,
    ) -> bool
    where
        F: Fn(String),
    {
        let status = self.core.status();
        let restartable = matches!(status, SessionStatus::Listening | SessionStatus::ListenStop)
            || (self.core.is_realtime() && status != SessionStatus::Init);
        if !restartable {
            debug!(?status, "empty ASR result outside a listening state");
            // Nothing to do until the next listen window arms a stream.
            return true;
        }
        if idle_since.elapsed() >= max_idle {
            on_error("ASR idle timeout with no speech".to_string());
            return false;
        }
        match self.restart().await {
            Ok(()) => true,
            Err(e) => {
                on_error(format!("ASR restart failed: {}", e));
                false
            }
        }
    }

    /// Steps taken when a non-empty final hypothesis lands.
    async fn commit_utterance(&self, text: String) {
        info!(text = %text, "ASR final");

        // User message with its audio, persisted one-shot: ASR knows both
        // the text and the PCM immediately.
        let pcm = self.core.asr_audio.drain();
        let audio = if pcm.is_empty() {
            None
        } else {
            Some(AudioData::PcmF32(f32_to_pcm_bytes(&pcm)))
        };
        self.core.commit_message(Message::user(text.clone()), audio);

        // Realtime mode 2: the commit itself interrupts the current turn.
        if self.core.is_realtime() && self.core.config.chat.realtime_mode == 2 {
            self.core.after_asr.cancel();
            self.tts.interrupt_and_clear();
        }

        self.core
            .send_control(ServerMessage::AsrResult { text: text.clone() })
            .await;

        // Bounded wait for the speaker verdict; late results degrade to None.
        let wait = Duration::from_millis(self.core.config.voice_identify.wait_ms);
        let speaker = self.speaker.take_result(wait).await;
        if let Some(result) = &speaker {
            self.apply_speaker_profile(result);
        }

        if self
            .chat_queue
            .push(ChatText { text, speaker })
            .is_err()
        {
            warn!("chat queue full, dropping committed utterance");
        }
    }

    /// Map an identified speaker onto prompt and voice overrides.
    fn apply_speaker_profile(&self, result: &SpeakerResult) {
        if !result.identified {
            return;
        }
        let Some(name) = &result.speaker_name else { return };
        if let Some(profile) = self.core.device_config.voice_identify.get(name) {
            if !profile.prompt.is_empty() {
                *self.core.speaker_prompt.lock().unwrap() = Some(profile.prompt.clone());
            }
            if let Some(voice) = &profile.tts_voice {
                *self.core.speaker_tts_voice.lock().unwrap() = Some(voice.clone());
            }
            debug!(speaker = %name, "speaker profile applied");
        }
    }
}
