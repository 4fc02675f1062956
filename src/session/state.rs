//! Per-session shared state
//!
//! One [`SessionCore`] exists per connected device and is shared by `Arc`
//! between the controller and its managers. Managers act on the core and on
//! each other's queues; none of them holds the controller.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, DeviceConfig};
use crate::events::{BusEvent, EventBus};
use crate::pool::PoolRegistry;
use crate::sync::Scope;
use crate::transport::{Outbound, ServerMessage};
use crate::types::{
    AddMessageEvent, AudioData, AudioFormat, Dialogue, Message, Role, SessionEndEvent,
};

/// Pipeline position of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Listening,
    ListenStop,
    LlmStart,
    TtsStart,
}

/// Listening window behavior negotiated via `listen` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    Auto,
    Manual,
    Realtime,
}

impl ListenMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => ListenMode::Manual,
            "realtime" => ListenMode::Realtime,
            _ => ListenMode::Auto,
        }
    }
}

/// Sliding PCM window feeding the VAD provider.
///
/// Keeps enough pre-roll that the start of an utterance is not clipped when
/// voice is first detected.
pub struct VadBuffer {
    samples: Vec<f32>,
    max_samples: usize,
}

impl VadBuffer {
    /// `max_ms` bounds the retained pre-roll.
    pub fn new(sample_rate: u32, max_ms: u32) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: (sample_rate as usize * max_ms as usize) / 1000,
        }
    }

    pub fn push(&mut self, pcm: &[f32]) {
        self.samples.extend_from_slice(pcm);
        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples currently buffered, expressed in milliseconds.
    pub fn duration_ms(&self, sample_rate: u32) -> u32 {
        (self.samples.len() as u64 * 1000 / sample_rate.max(1) as u64) as u32
    }

    /// Copy of the most recent `n` samples (the VAD analysis window).
    pub fn peek_last(&self, n: usize) -> Vec<f32> {
        let start = self.samples.len().saturating_sub(n);
        self.samples[start..].to_vec()
    }

    /// Take everything, leaving the buffer empty (pre-roll hand-off).
    pub fn drain(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }
}

/// Accumulates the PCM handed to ASR for the current utterance.
#[derive(Default)]
pub struct PcmHistory {
    samples: Mutex<Vec<f32>>,
}

impl PcmHistory {
    pub fn extend(&self, pcm: &[f32]) {
        self.samples.lock().unwrap().extend_from_slice(pcm);
    }

    pub fn drain(&self) -> Vec<f32> {
        std::mem::take(&mut *self.samples.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

/// Accumulates the encoded frames sent for the current assistant turn.
#[derive(Default)]
pub struct FrameHistory {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl FrameHistory {
    pub fn push(&self, frame: Vec<u8>) {
        self.frames.lock().unwrap().push(frame);
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

/// Speaker-identification verdict for the current utterance.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SpeakerResult {
    pub identified: bool,
    #[serde(default)]
    pub speaker_id: Option<String>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub threshold: f32,
}

/// Everything a session's tasks share.
pub struct SessionCore {
    pub session_id: String,
    pub device_id: String,
    pub agent_id: String,
    pub config: Arc<Config>,
    pub device_config: DeviceConfig,

    /// Input format; refined from the first decoded frame.
    pub input_format: Mutex<AudioFormat>,
    pub output_format: AudioFormat,

    pub status: Mutex<SessionStatus>,
    pub listen_mode: Mutex<ListenMode>,
    /// Whether a listening window is currently open.
    pub listening: AtomicBool,

    pub dialogue: Dialogue,
    pub memory_context: Mutex<Option<String>>,

    /// Session-level cancellation (child of the process token).
    pub session_token: CancellationToken,
    /// Barge-in scope: one child per user-utterance cycle.
    pub after_asr: Scope,

    pub outbound: mpsc::Sender<Outbound>,
    pub bus: Arc<EventBus>,
    pub pools: Arc<PoolRegistry>,

    /// ASR history-audio buffer (spec: user message carries its audio).
    pub asr_audio: PcmHistory,
    /// TTS audio-history buffer (phase-2 assistant persistence).
    pub tts_audio: FrameHistory,

    /// Memoised message ids per role so phase 2 finds phase 1's row.
    pub last_message_id: RwLock<HashMap<Role, String>>,

    pub last_active: Mutex<Instant>,
    pub welcome_played: AtomicBool,
    /// Realtime barge-in latch: set on first trigger, cleared at silence.
    pub barge_latched: AtomicBool,
    pub closed: AtomicBool,
    pub exit_requested: AtomicBool,
    /// Managers signal here to request an orderly close; the controller's
    /// run loop listens.
    pub close_notify: tokio::sync::Notify,

    /// Voice override chosen by speaker identification.
    pub speaker_tts_voice: Mutex<Option<String>>,
    /// Extra prompt description for the recognized speaker.
    pub speaker_prompt: Mutex<Option<String>>,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        config: Arc<Config>,
        device_config: DeviceConfig,
        input_format: AudioFormat,
        output_format: AudioFormat,
        process_token: &CancellationToken,
        outbound: mpsc::Sender<Outbound>,
        bus: Arc<EventBus>,
        pools: Arc<PoolRegistry>,
    ) -> Arc<Self> {
        let session_token = process_token.child_token();
        let after_asr = Scope::new(session_token.clone());
        Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_id: device_config.agent_id.clone(),
            device_id,
            config,
            device_config,
            input_format: Mutex::new(input_format),
            output_format,
            status: Mutex::new(SessionStatus::Init),
            listen_mode: Mutex::new(ListenMode::Auto),
            listening: AtomicBool::new(false),
            dialogue: Dialogue::new(),
            memory_context: Mutex::new(None),
            session_token,
            after_asr,
            outbound,
            bus,
            pools,
            asr_audio: PcmHistory::default(),
            tts_audio: FrameHistory::default(),
            last_message_id: RwLock::new(HashMap::new()),
            last_active: Mutex::new(Instant::now()),
            welcome_played: AtomicBool::new(false),
            barge_latched: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            close_notify: tokio::sync::Notify::new(),
            speaker_tts_voice: Mutex::new(None),
            speaker_prompt: Mutex::new(None),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut guard = self.status.lock().unwrap();
        if *guard != status {
            debug!(session_id = %self.session_id, from = ?*guard, to = ?status, "status");
            *guard = status;
        }
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.lock().unwrap()
    }

    pub fn is_realtime(&self) -> bool {
        self.listen_mode() == ListenMode::Realtime
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub async fn send_control(&self, message: ServerMessage) {
        let _ = self.outbound.send(Outbound::Json(message)).await;
    }

    pub async fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.outbound.send(Outbound::Frame(frame)).await;
    }

    /// Append a message to the dialogue, memoise its id, and publish the
    /// phase-1 persistence event. Returns the message id.
    pub fn commit_message(&self, message: Message, audio: Option<AudioData>) -> String {
        let id = crate::types::message_id(&self.session_id, message.role, message.time_ms);
        self.last_message_id
            .write()
            .unwrap()
            .insert(message.role, id.clone());
        self.dialogue.push(message.clone());
        let (sample_rate, channels) = match message.role {
            Role::User => {
                let f = *self.input_format.lock().unwrap();
                (f.sample_rate, f.channels)
            }
            _ => (self.output_format.sample_rate, self.output_format.channels),
        };
        self.bus.publish(BusEvent::AddMessage(AddMessageEvent {
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            agent_id: self.agent_id.clone(),
            message,
            message_id: id.clone(),
            audio,
            sample_rate,
            channels,
            is_update: false,
        }));
        id
    }

    /// Publish the phase-2 audio update for the last committed message of
    /// `role`. Skipped when phase 1 never produced an id.
    pub fn commit_audio_update(&self, role: Role, audio: AudioData) {
        let id = self.last_message_id.write().unwrap().remove(&role);
        let Some(message_id) = id else {
            debug!(session_id = %self.session_id, ?role, "no phase-1 id, skipping audio update");
            return;
        };
        let (sample_rate, channels) = match role {
            Role::User => {
                let f = *self.input_format.lock().unwrap();
                (f.sample_rate, f.channels)
            }
            _ => (self.output_format.sample_rate, self.output_format.channels),
        };
        self.bus.publish(BusEvent::AddMessage(AddMessageEvent {
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            agent_id: self.agent_id.clone(),
            message: Message {
                role,
                content: String::new(),
                tool_calls: None,
                tool_call_id: None,
                extra: None,
                time_ms: chrono::Utc::now().timestamp_millis(),
            },
            message_id,
            audio: Some(audio),
            sample_rate,
            channels,
            is_update: true,
        }));
    }

    pub fn publish_session_end(&self) {
        self.bus.publish(BusEvent::SessionEnd(SessionEndEvent {
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            agent_id: self.agent_id.clone(),
        }));
    }
}
