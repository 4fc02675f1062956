//! Session controller
//!
//! The top-level per-device state machine. Owns the scoped contexts, the
//! managers for each pipeline stage, and the queues between them; it
//! dispatches incoming control and audio messages and performs the
//! idempotent orderly close.
//!
//! ```text
//! Init ──hello──► (VAD loop started) ──listen.start──► Listening
//! Listening ──VAD silence (auto)──► ListenStop ──ASR result──► LlmStart
//! LlmStart ──first TTS sentence──► TtsStart
//! TtsStart ──TtsStop sent──► Listening (realtime) | Init
//! any ──abort | goodbye | exit words | exit tool──► closed
//! ```

pub mod asr;
pub mod llm;
pub mod speaker;
pub mod state;
pub mod tts;
pub mod vad_loop;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::events::EventBus;
use crate::history::HistoryService;
use crate::memory::LongMemory;
use crate::pool::PoolRegistry;
use crate::tools::{Operator, ToolRegistry};
use crate::transport::{ClientMessage, ListenState, Outbound, ServerMessage};
use crate::types::AudioFormat;

use asr::AsrManager;
use llm::LlmManager;
use speaker::SpeakerManager;
use state::{ListenMode, SessionCore, SessionStatus};
use tts::{TtsItem, TtsManager};
use vad_loop::VadLoop;

/// Inbound Opus frame buffering. Real-time audio is better dropped than
/// delayed, so overflow drops the newest frame with a warning.
const OPUS_CHANNEL_CAP: usize = 300;

pub struct SessionController {
    pub core: Arc<SessionCore>,
    tts: TtsManager,
    asr: Arc<AsrManager>,
    speaker: Arc<SpeakerManager>,
    opus_tx: mpsc::Sender<Vec<u8>>,
}

/// The capability interface tools and managers act through; holding this
/// instead of the controller breaks the reference cycle.
struct SessionOperator {
    core: Arc<SessionCore>,
}

#[async_trait]
impl Operator for SessionOperator {
    fn device_id(&self) -> &str {
        &self.core.device_id
    }

    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn request_exit(&self, reason: &str) {
        debug!(reason, "exit requested");
        self.core.exit_requested.store(true, Ordering::Release);
    }

    async fn send_iot(&self, payload: Value) -> Result<()> {
        self.core.send_control(ServerMessage::Iot { payload }).await;
        Ok(())
    }

    async fn search_knowledge(&self, base: &str, query: &str) -> Result<String> {
        // Retrieval backends are external collaborators; without one wired
        // in, the tool answers honestly.
        debug!(base, query, "knowledge search without a configured backend");
        Ok("No matching knowledge entries were found.".to_string())
    }
}

impl SessionController {
    /// Build a session and start its long-lived tasks. Called once the
    /// transport `hello` has been negotiated.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        device_id: String,
        config: Arc<Config>,
        device_config: DeviceConfig,
        input_format: AudioFormat,
        output_format: AudioFormat,
        process_token: &CancellationToken,
        outbound: mpsc::Sender<Outbound>,
        bus: Arc<EventBus>,
        pools: Arc<PoolRegistry>,
        long_memory: Option<Arc<dyn LongMemory>>,
        history: Option<Arc<HistoryService>>,
    ) -> Self {
        let core = SessionCore::new(
            device_id,
            config,
            device_config,
            input_format,
            output_format,
            process_token,
            outbound,
            bus,
            pools,
        );
        info!(session_id = %core.session_id, device_id = %core.device_id, "session created");

        let tts = TtsManager::new(core.clone());
        let speaker = Arc::new(SpeakerManager::new(core.clone()));
        let asr = AsrManager::new(core.clone(), speaker.clone(), tts.clone());

        let operator: Arc<dyn Operator> = Arc::new(SessionOperator { core: core.clone() });
        let registry = ToolRegistry::with_builtins(core.device_config.knowledge_bases.clone());
        let llm = LlmManager::new(
            core.clone(),
            tts.clone(),
            registry,
            operator,
            asr.chat_queue.clone(),
        );

        let (opus_tx, opus_rx) = mpsc::channel(OPUS_CHANNEL_CAP);

        tts.spawn();
        let _ = llm.spawn();
        {
            let core = core.clone();
            let _ = asr.spawn_result_loop(move |error| {
                warn!(error = %error, "fatal ASR failure");
                // The session must end: this is the one case the device is
                // told about the failure.
                let _ = core
                    .outbound
                    .try_send(Outbound::Json(ServerMessage::Error { message: error }));
                core.close_notify.notify_one();
            });
        }
        let _ = VadLoop {
            core: core.clone(),
            asr: asr.clone(),
            speaker: speaker.clone(),
            tts: tts.clone(),
        }
        .spawn(opus_rx);

        // Seed the dialogue with the device's recent history so the first
        // turn has context from earlier sessions.
        if let Some(history) = history {
            let core_for_history = core.clone();
            tokio::spawn(async move {
                let limit = core_for_history.config.chat.max_history;
                match history
                    .fetch_recent(
                        &core_for_history.device_id,
                        &core_for_history.agent_id,
                        None,
                        limit,
                    )
                    .await
                {
                    Ok(messages) if !messages.is_empty() => {
                        debug!(count = messages.len(), "seeded dialogue from history");
                        for message in messages {
                            core_for_history.dialogue.push(message);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "history seed unavailable"),
                }
            });
        }

        // Long-memory context is loaded once per session for prompt
        // assembly.
        if let Some(memory) = long_memory {
            let core_for_memory = core.clone();
            tokio::spawn(async move {
                match memory
                    .context(&core_for_memory.agent_id, &core_for_memory.device_id)
                    .await
                {
                    Ok(Some(context)) => {
                        *core_for_memory.memory_context.lock().unwrap() = Some(context);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "long-memory context unavailable"),
                }
            });
        }

        Self {
            core,
            tts,
            asr,
            speaker,
            opus_tx,
        }
    }

    /// Binary channel: one encoded Opus frame from the device.
    pub fn handle_audio_frame(&self, frame: Vec<u8>) {
        if self.opus_tx.try_send(frame).is_err() {
            warn!("opus input buffer full, dropping frame");
        }
    }

    /// Text channel: one parsed control message.
    pub async fn handle_control(&self, message: ClientMessage) {
        self.core.touch();
        match message {
            ClientMessage::Hello { .. } => {
                // Transport negotiated the hello before creating the
                // session; a repeat is a protocol slip, not fatal.
                debug!("duplicate hello ignored");
            }
            ClientMessage::Listen { state, mode, text } => {
                self.handle_listen(state, mode, text).await;
            }
            ClientMessage::Abort => {
                debug!("abort: device barge-in");
                self.core.after_asr.cancel();
                self.tts.interrupt_and_clear();
                self.core.set_status(SessionStatus::Listening);
            }
            ClientMessage::Iot { text } => {
                debug!(descriptor = %text, "IoT descriptor received");
            }
            ClientMessage::Mcp { payload } => {
                self.handle_mcp(payload).await;
            }
            ClientMessage::Goodbye => {
                self.close().await;
            }
        }
    }

    async fn handle_listen(&self, state: ListenState, mode: Option<String>, text: Option<String>) {
        if let Some(mode) = mode {
            let parsed = ListenMode::parse(&mode);
            *self.core.listen_mode.lock().unwrap() = parsed;
            debug!(?parsed, "listen mode set");
        }
        match state {
            ListenState::Start => {
                self.core.listening.store(true, Ordering::Release);
                // Status moves to Listening *before* the ASR restart so the
                // empty-result restart policy sees the intended state.
                self.core.set_status(SessionStatus::Listening);
                if !self.asr.input_open() {
                    if let Err(e) = self.asr.restart().await {
                        warn!(error = %e, "ASR restart on listen start failed");
                    }
                }
                self.maybe_greet().await;
            }
            ListenState::Stop => {
                self.core.listening.store(false, Ordering::Release);
                if self.core.listen_mode() == ListenMode::Manual {
                    // Manual windows commit on the device's stop edge.
                    self.asr.stop_input();
                    self.core.set_status(SessionStatus::ListenStop);
                    self.speaker.finish_and_identify();
                }
            }
            ListenState::Detect => {
                if let Some(word) = text {
                    info!(wake_word = %word, "wake word detected");
                }
                self.maybe_greet().await;
            }
        }
    }

    async fn handle_mcp(&self, payload: Value) {
        // MCP JSON-RPC passthrough: acknowledge with a minimal result
        // envelope; tool registries behind it are external.
        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {},
        });
        self.core
            .send_control(ServerMessage::Mcp { payload: reply })
            .await;
    }

    /// Speak a configured greeting once per session.
    async fn maybe_greet(&self) {
        if !self.core.config.greeting.enable_greeting {
            return;
        }
        if self.core.welcome_played.swap(true, Ordering::AcqRel) {
            return;
        }
        let greeting = {
            let list = &self.core.config.greeting.greeting_list;
            list.choose(&mut rand::rng()).cloned()
        };
        let Some(greeting) = greeting else { return };
        debug!(greeting = %greeting, "playing greeting");
        let _ = self.tts.enqueue(TtsItem::sentence(greeting, true));
        let _ = self.tts.enqueue(TtsItem::end());
    }

    /// Orderly, idempotent close. Safe to call any number of times; side
    /// effects run exactly once. Order matters: cancel contexts first so
    /// in-flight producers stop, then clear queues, then tear down.
    pub async fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.core.session_id, "closing session");

        self.core.after_asr.cancel();
        self.core.session_token.cancel();

        self.tts.interrupt_and_clear();
        self.tts.close();
        self.asr.chat_queue.close();
        self.asr.stop_input();
        self.asr.release_provider().await;
        self.speaker.close();

        self.core.send_control(ServerMessage::Goodbye).await;
        self.core.publish_session_end();
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }
}
