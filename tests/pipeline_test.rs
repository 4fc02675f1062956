//! Pipeline integration tests with mock providers
//!
//! Everything here drives the real session machinery (queues, scopes,
//! managers, paced sender) against in-process provider mocks injected
//! through the pool registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxhub::config::Config;
use voxhub::events::{EventBus, Topic};
use voxhub::pool::{PoolRegistry, ResourcePool};
use voxhub::providers::{
    AsrEvent, AsrProvider, LlmDelta, LlmProvider, TtsProvider, VadProvider,
};
use voxhub::session::asr::AsrManager;
use voxhub::session::llm::LlmManager;
use voxhub::session::speaker::SpeakerManager;
use voxhub::session::state::{SessionCore, SessionStatus};
use voxhub::session::tts::{TtsItem, TtsManager};
use voxhub::tools::ToolRegistry;
use voxhub::transport::{Outbound, ServerMessage};
use voxhub::types::{AudioFormat, Role};

// ─── Mock providers ──────────────────────────────────────────

struct MockVad;

impl VadProvider for MockVad {
    fn reset(&mut self) {}
    fn is_voice(&mut self, pcm: &[f32], _sr: u32, _fs: usize) -> anyhow::Result<bool> {
        Ok(pcm.iter().any(|&s| s.abs() > 0.1))
    }
}

/// Emits one final hypothesis after consuming the first PCM chunk.
struct MockAsr {
    text: String,
}

impl AsrProvider for MockAsr {
    fn streaming_recognize(
        &mut self,
        cancel: CancellationToken,
        mut pcm_rx: mpsc::Receiver<Vec<f32>>,
        _sample_rate: u32,
    ) -> anyhow::Result<mpsc::Receiver<AsrEvent>> {
        let (tx, rx) = mpsc::channel(8);
        let text = self.text.clone();
        tokio::spawn(async move {
            tokio::select! {
                chunk = pcm_rx.recv() => {
                    if chunk.is_some() {
                        let _ = tx.send(AsrEvent { text, is_final: true, error: None }).await;
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        Ok(rx)
    }
}

/// Streams fixed content deltas, then closes.
struct MockLlm {
    deltas: Vec<String>,
}

impl LlmProvider for MockLlm {
    fn response_with_context(
        &mut self,
        _cancel: CancellationToken,
        _session_id: &str,
        _messages: Vec<voxhub::types::Message>,
        _tools: Vec<voxhub::tools::ToolDefinition>,
    ) -> mpsc::Receiver<LlmDelta> {
        let (tx, rx) = mpsc::channel(8);
        let deltas = self.deltas.clone();
        tokio::spawn(async move {
            for d in deltas {
                let _ = tx
                    .send(LlmDelta {
                        content: Some(d),
                        ..Default::default()
                    })
                    .await;
            }
        });
        rx
    }
}

/// Produces `frames` dummy Opus frames, optionally spaced out in time.
struct MockTts {
    frames: usize,
    gap: Duration,
}

impl TtsProvider for MockTts {
    fn text_to_speech_stream(
        &mut self,
        cancel: CancellationToken,
        _text: &str,
        _format: AudioFormat,
    ) -> anyhow::Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(32);
        let frames = self.frames;
        let gap = self.gap;
        tokio::spawn(async move {
            for i in 0..frames {
                if !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
                if cancel.is_cancelled() {
                    break;
                }
                if tx.send(vec![i as u8; 10]).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ─── Harness ─────────────────────────────────────────────────

fn mock_pools(tts_frames: usize, tts_gap: Duration, llm_deltas: Vec<String>) -> Arc<PoolRegistry> {
    let timeout = Duration::from_millis(500);
    PoolRegistry::with_factories(
        ResourcePool::new("vad", 2, timeout, |_k| {
            Ok(Box::new(MockVad) as Box<dyn VadProvider>)
        }),
        ResourcePool::new("asr", 2, timeout, |_k| {
            Ok(Box::new(MockAsr {
                text: "hello world".into(),
            }) as Box<dyn AsrProvider>)
        }),
        ResourcePool::new("llm", 2, timeout, move |_k| {
            Ok(Box::new(MockLlm {
                deltas: llm_deltas.clone(),
            }) as Box<dyn LlmProvider>)
        }),
        ResourcePool::new("tts", 2, timeout, move |_k| {
            Ok(Box::new(MockTts {
                frames: tts_frames,
                gap: tts_gap,
            }) as Box<dyn TtsProvider>)
        }),
    )
}

fn test_core(
    pools: Arc<PoolRegistry>,
) -> (
    Arc<SessionCore>,
    mpsc::Receiver<Outbound>,
    Arc<EventBus>,
    CancellationToken,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let bus = Arc::new(EventBus::new());
    let process = CancellationToken::new();
    let format = AudioFormat {
        sample_rate: 16000,
        channels: 1,
        frame_duration_ms: 20,
    };
    let core = SessionCore::new(
        "dev-test".into(),
        Arc::new(Config::default()),
        Default::default(),
        format,
        format,
        &process,
        outbound_tx,
        bus.clone(),
        pools,
    );
    (core, outbound_rx, bus, process)
}

/// Collect outbound messages until TtsStop or timeout; returns labels.
async fn collect_until_stop(rx: &mut mpsc::Receiver<Outbound>, budget: Duration) -> Vec<String> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(Outbound::Json(m))) => {
                let label = match &m {
                    ServerMessage::TtsStart => "tts_start".to_string(),
                    ServerMessage::TtsStop => "tts_stop".to_string(),
                    ServerMessage::SentenceStart { .. } => "sentence_start".to_string(),
                    ServerMessage::SentenceEnd { .. } => "sentence_end".to_string(),
                    ServerMessage::AsrResult { .. } => "asr_result".to_string(),
                    other => format!("{:?}", other),
                };
                let is_stop = label == "tts_stop";
                seen.push(label);
                if is_stop {
                    break;
                }
            }
            Ok(Some(Outbound::Frame(_))) => seen.push("frame".to_string()),
            Ok(None) | Err(_) => break,
        }
    }
    seen
}

// ─── Tests ───────────────────────────────────────────────────

#[tokio::test]
async fn tts_turn_is_framed_and_paced() {
    let pools = mock_pools(5, Duration::ZERO, vec![]);
    let (core, mut outbound_rx, _bus, _process) = test_core(pools);
    let tts = TtsManager::new(core.clone());
    tts.spawn();

    let started = Instant::now();
    tts.enqueue(TtsItem::sentence("Hello there.", true)).unwrap();
    tts.enqueue(TtsItem::end()).unwrap();

    let seen = collect_until_stop(&mut outbound_rx, Duration::from_secs(3)).await;
    let elapsed = started.elapsed();

    assert_eq!(seen.first().map(String::as_str), Some("tts_start"));
    assert_eq!(seen.last().map(String::as_str), Some("tts_stop"));
    assert_eq!(seen.iter().filter(|s| *s == "frame").count(), 5);
    assert_eq!(seen.iter().filter(|s| *s == "sentence_start").count(), 1);
    assert_eq!(seen.iter().filter(|s| *s == "sentence_end").count(), 1);

    // Frames appear strictly between sentence_start and sentence_end.
    let first_frame = seen.iter().position(|s| s == "frame").unwrap();
    let sentence_start = seen.iter().position(|s| s == "sentence_start").unwrap();
    assert!(sentence_start < first_frame);

    // The stop waited for playout: 5 frames x 20 ms + 150 ms tail.
    assert!(
        elapsed >= Duration::from_millis(240),
        "TtsStop too early: {:?}",
        elapsed
    );
    assert!(elapsed < Duration::from_secs(2), "TtsStop too late: {:?}", elapsed);
}

#[tokio::test]
async fn barge_in_emits_stop_and_clears() {
    // A slow provider: 200 frames, 10 ms apart, so the turn is mid-flight
    // when the interruption lands.
    let pools = mock_pools(200, Duration::from_millis(10), vec![]);
    let (core, mut outbound_rx, _bus, _process) = test_core(pools);
    let tts = TtsManager::new(core.clone());
    tts.spawn();

    tts.enqueue(TtsItem::sentence("A long answer being spoken.", true))
        .unwrap();

    // Wait for the turn to open.
    let opened = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
        .await
        .expect("no output")
        .expect("channel closed");
    assert!(matches!(opened, Outbound::Json(ServerMessage::TtsStart)));

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Barge-in: cancel the turn scope, clear the queues.
    let cancelled_at = Instant::now();
    core.after_asr.cancel();
    tts.interrupt_and_clear();

    // A TtsStop must arrive promptly (within a frame duration plus drain).
    let mut stop_latency = None;
    while let Ok(Some(msg)) =
        tokio::time::timeout(Duration::from_millis(500), outbound_rx.recv()).await
    {
        if matches!(msg, Outbound::Json(ServerMessage::TtsStop)) {
            stop_latency = Some(cancelled_at.elapsed());
            break;
        }
    }
    let latency = stop_latency.expect("no TtsStop after barge-in");
    assert!(latency < Duration::from_millis(200), "stop latency {:?}", latency);
}

#[tokio::test]
async fn asr_commit_persists_and_feeds_chat_queue() {
    let pools = mock_pools(1, Duration::ZERO, vec![]);
    let (core, mut outbound_rx, bus, _process) = test_core(pools);
    let mut add_rx = bus.subscribe(Topic::AddMessage);

    let tts = TtsManager::new(core.clone());
    let speaker = Arc::new(SpeakerManager::new(core.clone()));
    let asr = AsrManager::new(core.clone(), speaker, tts);

    core.set_status(SessionStatus::Listening);
    asr.restart().await.unwrap();
    let _loop = asr.spawn_result_loop(|e| panic!("asr error: {}", e));

    // Feed one audible chunk; the mock recognizer finalizes on it.
    asr.add_pcm(&vec![0.3f32; 320]);

    // Committed text reaches the chat queue with no speaker verdict.
    let chat = tokio::time::timeout(
        Duration::from_secs(2),
        asr.chat_queue.pop(&core.session_token),
    )
    .await
    .expect("chat queue timeout")
    .unwrap();
    assert_eq!(chat.text, "hello world");
    assert!(chat.speaker.is_none());

    // Phase-1 persistence event carries the utterance audio.
    let event = tokio::time::timeout(Duration::from_secs(1), add_rx.recv())
        .await
        .expect("no AddMessage event")
        .unwrap();
    match event {
        voxhub::events::BusEvent::AddMessage(ev) => {
            assert_eq!(ev.message.role, Role::User);
            assert_eq!(ev.message.content, "hello world");
            assert!(!ev.is_update);
            assert!(ev.audio.is_some());
            assert_eq!(ev.message_id.len(), 32);
        }
        other => panic!("unexpected event {:?}", other.topic()),
    }

    // The transport saw the asr_result frame.
    let mut saw_asr_result = false;
    while let Ok(Some(msg)) =
        tokio::time::timeout(Duration::from_millis(200), outbound_rx.recv()).await
    {
        if matches!(msg, Outbound::Json(ServerMessage::AsrResult { .. })) {
            saw_asr_result = true;
            break;
        }
    }
    assert!(saw_asr_result);
}

#[tokio::test]
async fn llm_turn_streams_sentences_and_persists_assistant() {
    let pools = mock_pools(
        2,
        Duration::ZERO,
        vec!["It is sunny. ".to_string(), "Enjoy your day!".to_string()],
    );
    let (core, mut outbound_rx, bus, _process) = test_core(pools);
    let mut add_rx = bus.subscribe(Topic::AddMessage);

    let tts = TtsManager::new(core.clone());
    tts.spawn();

    struct NoopOperator;
    #[async_trait::async_trait]
    impl voxhub::tools::Operator for NoopOperator {
        fn device_id(&self) -> &str {
            "dev-test"
        }
        fn session_id(&self) -> &str {
            "sess-test"
        }
        fn request_exit(&self, _reason: &str) {}
        async fn send_iot(&self, _payload: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn search_knowledge(&self, _base: &str, _query: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    let chat_queue = Arc::new(voxhub::sync::BoundedQueue::new(4));
    let llm = LlmManager::new(
        core.clone(),
        tts.clone(),
        ToolRegistry::new(),
        Arc::new(NoopOperator),
        chat_queue.clone(),
    );
    llm.spawn();

    core.dialogue.push(voxhub::types::Message::user("weather?"));
    chat_queue
        .push(voxhub::session::asr::ChatText {
            text: "weather?".into(),
            speaker: None,
        })
        .unwrap();

    let seen = collect_until_stop(&mut outbound_rx, Duration::from_secs(3)).await;
    assert_eq!(seen.iter().filter(|s| *s == "sentence_start").count(), 2);
    assert_eq!(seen.last().map(String::as_str), Some("tts_stop"));

    // Assistant message persisted (phase 1, no audio yet).
    let mut assistant_phase1 = false;
    let mut assistant_phase2 = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(300), add_rx.recv()).await
    {
        if let voxhub::events::BusEvent::AddMessage(ev) = event {
            if ev.message.role == Role::Assistant && !ev.is_update {
                assert!(ev.message.content.contains("sunny"));
                assistant_phase1 = true;
            }
            if ev.is_update {
                assert!(ev.audio.is_some());
                assistant_phase2 = true;
            }
        }
    }
    assert!(assistant_phase1, "assistant phase-1 event missing");
    assert!(assistant_phase2, "assistant phase-2 audio event missing");

    // The dialogue gained the assistant turn.
    let tail = core.dialogue.recent(5);
    assert!(tail
        .iter()
        .any(|m| m.role == Role::Assistant && m.content.contains("sunny")));
}

#[tokio::test]
async fn pool_never_double_allocates() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    struct Counting;
    impl VadProvider for Counting {
        fn reset(&mut self) {}
        fn is_voice(&mut self, _p: &[f32], _sr: u32, _fs: usize) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    let pool: ResourcePool<Box<dyn VadProvider>> =
        ResourcePool::new("vad", 2, Duration::from_secs(2), |_k| {
            Ok(Box::new(Counting) as Box<dyn VadProvider>)
        });
    let pool = Arc::new(pool);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let wrapper = pool.acquire("k").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                pool.release(wrapper);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "pool exposed more instances than its size: {}",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn auto_mode_utterance_reaches_tts_stop() {
    use voxhub::audio::codec::OpusFrameEncoder;
    use voxhub::transport::{ClientMessage, ListenState};

    let pools = mock_pools(2, Duration::ZERO, vec!["It is sunny.".to_string()]);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(512);
    let bus = Arc::new(EventBus::new());
    let process = CancellationToken::new();
    let format = AudioFormat {
        sample_rate: 16000,
        channels: 1,
        frame_duration_ms: 20,
    };
    let mut config = Config::default();
    config.greeting.enable_greeting = false;

    let controller = voxhub::session::SessionController::start(
        "dev-e2e".into(),
        Arc::new(config),
        Default::default(),
        format,
        format,
        &process,
        outbound_tx,
        bus,
        pools,
        None,
        None,
    );

    controller
        .handle_control(ClientMessage::Listen {
            state: ListenState::Start,
            mode: Some("auto".into()),
            text: None,
        })
        .await;

    // 500 ms silence, 800 ms speech, 500 ms silence, as 20 ms Opus frames.
    let mut encoder = OpusFrameEncoder::new(16000, 1, 20).unwrap();
    let silence = vec![0.0f32; 320];
    let speech: Vec<f32> = (0..320).map(|i| (i as f32 * 0.2).sin() * 0.4).collect();
    for _ in 0..25 {
        controller.handle_audio_frame(encoder.encode_frame(&silence).unwrap());
    }
    for _ in 0..40 {
        controller.handle_audio_frame(encoder.encode_frame(&speech).unwrap());
    }
    for _ in 0..25 {
        controller.handle_audio_frame(encoder.encode_frame(&silence).unwrap());
    }

    // The whole pipeline runs: asr_result, then a framed TTS turn.
    let mut saw_asr_result = false;
    let mut saw_tts_start = false;
    let mut saw_frame = false;
    let mut saw_tts_stop = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !saw_tts_stop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, outbound_rx.recv()).await {
            Ok(Some(Outbound::Json(ServerMessage::AsrResult { text }))) => {
                assert_eq!(text, "hello world");
                saw_asr_result = true;
            }
            Ok(Some(Outbound::Json(ServerMessage::TtsStart))) => saw_tts_start = true,
            Ok(Some(Outbound::Json(ServerMessage::TtsStop))) => saw_tts_stop = true,
            Ok(Some(Outbound::Frame(_))) => saw_frame = true,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    assert!(saw_asr_result, "asr_result never sent");
    assert!(saw_tts_start, "TtsStart never sent");
    assert!(saw_frame, "no audio frames sent");
    assert!(saw_tts_stop, "TtsStop never sent");

    controller.close().await;
}

#[tokio::test]
async fn session_close_is_idempotent() {
    let pools = mock_pools(1, Duration::ZERO, vec![]);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let bus = Arc::new(EventBus::new());
    let mut end_rx = bus.subscribe(Topic::SessionEnd);
    let process = CancellationToken::new();
    let format = AudioFormat {
        sample_rate: 16000,
        channels: 1,
        frame_duration_ms: 20,
    };

    let controller = voxhub::session::SessionController::start(
        "dev-close".into(),
        Arc::new(Config::default()),
        Default::default(),
        format,
        format,
        &process,
        outbound_tx,
        bus.clone(),
        pools,
        None,
        None,
    );

    controller.close().await;
    controller.close().await;
    controller.close().await;
    assert!(controller.is_closed());

    // Exactly one SessionEnd despite repeated closes.
    let first = tokio::time::timeout(Duration::from_secs(1), end_rx.recv())
        .await
        .expect("no SessionEnd")
        .unwrap();
    assert!(matches!(first, voxhub::events::BusEvent::SessionEnd(_)));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), end_rx.recv())
            .await
            .is_err(),
        "SessionEnd emitted more than once"
    );

    // Exactly one goodbye frame on the wire.
    let mut goodbyes = 0;
    while let Ok(Some(msg)) =
        tokio::time::timeout(Duration::from_millis(100), outbound_rx.recv()).await
    {
        if matches!(msg, Outbound::Json(ServerMessage::Goodbye)) {
            goodbyes += 1;
        }
    }
    assert_eq!(goodbyes, 1);
}

#[tokio::test]
async fn scope_cancel_then_get_is_fresh() {
    let pools = mock_pools(1, Duration::ZERO, vec![]);
    let (core, _outbound_rx, _bus, _process) = test_core(pools);
    let t1 = core.after_asr.get();
    core.after_asr.cancel();
    assert!(t1.is_cancelled());
    let t2 = core.after_asr.get();
    assert!(!t2.is_cancelled());
    // Session-level cancel reaches the fresh child.
    core.session_token.cancel();
    assert!(t2.is_cancelled());
}
