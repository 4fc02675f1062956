//! TTS dispatch and the real-time paced sender
//!
//! Three queues interact. Producers (LLM sentences, greetings, farewells)
//! push [`TtsItem`]s; a dispatcher acquires a voice-keyed provider per
//! segment and pushes `SentenceStart → Frame* → SentenceEnd` onto the
//! session audio queue; the single sender task walks that queue and writes
//! to the transport, pacing frames against absolute time so the device's
//! jitter buffer stays in a narrow band.
//!
//! Serializing everything through one queue and one sender makes barge-in
//! correct by construction: cancel the turn scope, drain the queue, and the
//! next utterance starts clean.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::{SessionCore, SessionStatus};
use crate::pool::PoolRegistry;
use crate::sync::{BoundedQueue, QueueError};
use crate::transport::ServerMessage;
use crate::types::{AudioData, Role};

/// Client-side jitter buffer the pacing math keeps ahead of playback.
const CACHE_MS: u64 = 120;
/// Settle time after the last frame before TtsStop goes out.
const TAIL_MS: u64 = 150;
/// Budget for one synthesis segment.
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(30);

const ITEM_QUEUE_CAP: usize = 10;
const AUDIO_QUEUE_CAP: usize = 150;

/// One sentence (or injected utterance) to synthesize.
pub struct TtsItem {
    pub text: String,
    /// First sentence of an assistant turn.
    pub is_start: bool,
    /// Turn-final marker; text is empty.
    pub is_end: bool,
    /// Pre-encoded frames (tool audio) played instead of synthesizing.
    pub frames: Option<Vec<Vec<u8>>>,
    /// Fired after the sentence has been fully sent to the device.
    pub on_end: Option<oneshot::Sender<()>>,
}

impl TtsItem {
    pub fn sentence(text: impl Into<String>, is_start: bool) -> Self {
        Self {
            text: text.into(),
            is_start,
            is_end: false,
            frames: None,
            on_end: None,
        }
    }

    pub fn frames(label: impl Into<String>, frames: Vec<Vec<u8>>) -> Self {
        Self {
            text: label.into(),
            is_start: false,
            is_end: false,
            frames: Some(frames),
            on_end: None,
        }
    }

    pub fn end() -> Self {
        Self {
            text: String::new(),
            is_start: false,
            is_end: true,
            frames: None,
            on_end: None,
        }
    }

    pub fn with_on_end(mut self, tx: oneshot::Sender<()>) -> Self {
        self.on_end = Some(tx);
        self
    }
}

/// Typed elements of the serialized session audio queue.
pub enum AudioElement {
    TtsStart,
    SentenceStart { text: String, is_start: bool },
    Frame(Vec<u8>),
    SentenceEnd {
        text: String,
        done: Option<oneshot::Sender<()>>,
    },
    TtsStop,
}

#[derive(Clone)]
pub struct TtsManager {
    core: Arc<SessionCore>,
    items: Arc<BoundedQueue<TtsItem>>,
    audio: Arc<BoundedQueue<AudioElement>>,
}

impl TtsManager {
    pub fn new(core: Arc<SessionCore>) -> Self {
        Self {
            core,
            items: Arc::new(BoundedQueue::new(ITEM_QUEUE_CAP)),
            audio: Arc::new(BoundedQueue::new(AUDIO_QUEUE_CAP)),
        }
    }

    /// Queue a sentence for synthesis. Overflow drops the sentence and
    /// tells the caller; a slow provider back-pressures the sentence
    /// extractor naturally before this trips.
    pub fn enqueue(&self, item: TtsItem) -> Result<(), QueueError> {
        self.items.push(item)
    }

    /// Barge-in path: drop everything queued without emitting TtsStop (the
    /// turn cancellation already did at the transport level).
    pub fn interrupt_and_clear(&self) {
        let dropped_items = self.items.clear().len();
        let dropped_audio = self.audio.clear().len();
        if dropped_items + dropped_audio > 0 {
            debug!(
                dropped_items,
                dropped_audio, "interrupt cleared TTS queues"
            );
        }
    }

    pub fn close(&self) {
        self.items.close();
        self.audio.close();
    }

    /// Start the dispatcher and sender tasks.
    pub fn spawn(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let dispatcher = tokio::spawn(dispatch_loop(
            self.core.clone(),
            self.items.clone(),
            self.audio.clone(),
        ));
        let sender = tokio::spawn(sender_loop(self.core.clone(), self.audio.clone()));
        (dispatcher, sender)
    }
}

/// Pops TTS items, synthesizes each through a pooled provider, and feeds
/// the session audio queue in order.
async fn dispatch_loop(
    core: Arc<SessionCore>,
    items: Arc<BoundedQueue<TtsItem>>,
    audio: Arc<BoundedQueue<AudioElement>>,
) {
    let session_token = core.session_token.clone();
    let mut turn_open = false;
    let mut open_token: Option<CancellationToken> = None;

    loop {
        let item = match items.pop(&session_token).await {
            Ok(item) => item,
            Err(_) => break,
        };
        let turn_token = core.after_asr.get();

        // A barge-in closed the previous turn under us; the next sentence
        // must open a fresh one.
        if turn_open
            && open_token
                .as_ref()
                .map(|t| t.is_cancelled())
                .unwrap_or(true)
        {
            turn_open = false;
            open_token = None;
        }

        if item.is_end {
            if turn_open {
                if audio.push_wait(AudioElement::TtsStop, &turn_token).await.is_err() {
                    continue;
                }
                turn_open = false;
            }
            continue;
        }
        if item.frames.is_none() && item.text.trim().is_empty() {
            continue;
        }

        if !turn_open {
            if audio.push_wait(AudioElement::TtsStart, &turn_token).await.is_err() {
                continue;
            }
            turn_open = true;
            open_token = Some(turn_token.clone());
        }
        if audio
            .push_wait(
                AudioElement::SentenceStart {
                    text: item.text.clone(),
                    is_start: item.is_start,
                },
                &turn_token,
            )
            .await
            .is_err()
        {
            continue;
        }

        // Pre-encoded tool audio bypasses synthesis entirely.
        if let Some(frames) = item.frames {
            let mut interrupted = false;
            for frame in frames {
                if audio.push_wait(AudioElement::Frame(frame), &turn_token).await.is_err() {
                    interrupted = true;
                    break;
                }
            }
            if !interrupted {
                let _ = audio
                    .push_wait(
                        AudioElement::SentenceEnd {
                            text: item.text,
                            done: item.on_end,
                        },
                        &turn_token,
                    )
                    .await;
            }
            continue;
        }

        // Speaker identification may have picked a different voice.
        let voice = core
            .speaker_tts_voice
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| core.device_config.tts_voice.clone());
        let key = PoolRegistry::tts_key(&core.device_config.tts, &voice);

        let mut provider = match core.pools.tts.acquire(&key).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "TTS acquire failed, dropping sentence");
                let _ = audio
                    .push_wait(
                        AudioElement::SentenceEnd {
                            text: item.text,
                            done: item.on_end,
                        },
                        &turn_token,
                    )
                    .await;
                continue;
            }
        };

        let stream = provider
            .get_mut()
            .text_to_speech_stream(turn_token.clone(), &item.text, core.output_format);
        let mut failed = false;
        match stream {
            Ok(mut frame_rx) => {
                loop {
                    let frame = tokio::select! {
                        f = tokio::time::timeout(SEGMENT_TIMEOUT, frame_rx.recv()) => match f {
                            Ok(f) => f,
                            Err(_) => {
                                warn!("TTS segment timed out");
                                failed = true;
                                break;
                            }
                        },
                        _ = turn_token.cancelled() => break,
                    };
                    let Some(frame) = frame else { break };
                    if audio.push_wait(AudioElement::Frame(frame), &turn_token).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "TTS synthesis failed");
                failed = true;
            }
        }

        if failed {
            // Damaged mid-segment; do not return it warm.
            core.pools.tts.discard(provider);
        } else {
            core.pools.tts.release(provider);
        }

        let _ = audio
            .push_wait(
                AudioElement::SentenceEnd {
                    text: item.text,
                    done: item.on_end,
                },
                &turn_token,
            )
            .await;
    }
    debug!("TTS dispatcher stopped");
}

struct TurnPacing {
    token: CancellationToken,
    start: Instant,
    total_frames: u64,
    frame_ms: u64,
    cache_frames: u64,
    first_frame_reported: bool,
}

/// The only task that writes audio to the transport.
async fn sender_loop(core: Arc<SessionCore>, audio: Arc<BoundedQueue<AudioElement>>) {
    let session_token = core.session_token.clone();
    let mut turn: Option<TurnPacing> = None;

    enum Next {
        Element(AudioElement),
        TurnCancelled,
        Stopped,
    }

    loop {
        let next = if let Some(t) = &turn {
            tokio::select! {
                e = audio.pop(&session_token) => match e {
                    Ok(e) => Next::Element(e),
                    Err(_) => Next::Stopped,
                },
                _ = t.token.cancelled() => Next::TurnCancelled,
            }
        } else {
            match audio.pop(&session_token).await {
                Ok(e) => Next::Element(e),
                Err(_) => Next::Stopped,
            }
        };
        let element = match next {
            Next::Element(element) => element,
            Next::TurnCancelled => {
                // Barge-in: stop the turn at the transport level and flush
                // whatever was queued behind us.
                core.send_control(ServerMessage::TtsStop).await;
                drain_turn_tail(&audio);
                finish_turn(&core, turn.take());
                continue;
            }
            Next::Stopped => break,
        };

        match element {
            AudioElement::TtsStart => {
                core.send_control(ServerMessage::TtsStart).await;
                core.set_status(SessionStatus::TtsStart);
                let frame_ms = core.output_format.frame_duration_ms.max(1) as u64;
                turn = Some(TurnPacing {
                    token: core.after_asr.get(),
                    start: Instant::now(),
                    total_frames: 0,
                    frame_ms,
                    cache_frames: CACHE_MS / frame_ms,
                    first_frame_reported: false,
                });
            }
            AudioElement::SentenceStart { text, is_start } => {
                if is_start {
                    if let Some(t) = &turn {
                        debug!(
                            latency_ms = t.start.elapsed().as_millis() as u64,
                            "first sentence reached sender"
                        );
                    }
                }
                core.send_control(ServerMessage::SentenceStart { text }).await;
            }
            AudioElement::Frame(frame) => {
                let Some(t) = &mut turn else {
                    // Stale frame behind a cleared turn.
                    continue;
                };
                // Absolute-time pacing: frame N is due at
                // start + (N - cache_frames) * frame_duration.
                let due_frame = t.total_frames.saturating_sub(t.cache_frames);
                let due = t.start + Duration::from_millis(due_frame * t.frame_ms);
                let now = Instant::now();
                if now < due {
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => false,
                        _ = t.token.cancelled() => true,
                    };
                    if cancelled {
                        core.send_control(ServerMessage::TtsStop).await;
                        drain_turn_tail(&audio);
                        finish_turn(&core, turn.take());
                        continue;
                    }
                }
                if !t.first_frame_reported {
                    t.first_frame_reported = true;
                    debug!(
                        latency_ms = t.start.elapsed().as_millis() as u64,
                        "first audio frame sent"
                    );
                }
                core.tts_audio.push(frame.clone());
                core.send_frame(frame).await;
                t.total_frames += 1;
            }
            AudioElement::SentenceEnd { text, done } => {
                core.send_control(ServerMessage::SentenceEnd { text }).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            AudioElement::TtsStop => {
                if let Some(t) = &turn {
                    // Let the last frame play out on the device, plus tail.
                    let play_end = t.start
                        + Duration::from_millis(t.total_frames * t.frame_ms + TAIL_MS);
                    let now = Instant::now();
                    if now < play_end {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(play_end)) => {}
                            _ = t.token.cancelled() => {}
                        }
                    }
                }
                core.send_control(ServerMessage::TtsStop).await;
                finish_turn(&core, turn.take());
            }
        }
    }
    debug!("TTS sender stopped");
}

/// Drop queued elements left over from a cancelled turn. If the next
/// turn's TtsStart is already queued, it and everything behind it are
/// pushed back intact.
fn drain_turn_tail(audio: &BoundedQueue<AudioElement>) {
    let drained = audio.clear();
    let mut keep = false;
    for element in drained {
        if matches!(element, AudioElement::TtsStart) {
            keep = true;
        }
        if keep {
            let _ = audio.push(element);
        } else if let AudioElement::SentenceEnd { done: Some(done), .. } = element {
            let _ = done.send(());
        }
    }
}

/// Turn teardown: phase-2 audio persistence and status fall-back.
fn finish_turn(core: &SessionCore, turn: Option<TurnPacing>) {
    if turn.is_none() {
        return;
    }
    let frames = core.tts_audio.drain();
    if !frames.is_empty() {
        core.commit_audio_update(Role::Assistant, AudioData::OpusFrames(frames));
    }
    if core.is_realtime() {
        core.set_status(SessionStatus::Listening);
    } else {
        core.set_status(SessionStatus::Init);
    }
}
