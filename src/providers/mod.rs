//! Provider abstractions for the four pipeline stages
//!
//! Concrete voice models live behind these traits; the pipeline only ever
//! sees pooled trait objects. Streaming providers hand results back over
//! channels so every consumer can pair reads with cancellation.

pub mod asr;
pub mod llm;
pub mod tts;
pub mod vad;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolDefinition;
use crate::types::{AudioFormat, Message};

/// One streaming-recognizer hypothesis.
#[derive(Debug, Clone)]
pub struct AsrEvent {
    pub text: String,
    pub is_final: bool,
    pub error: Option<String>,
}

/// One LLM stream delta. The channel closing marks the end of the stream;
/// `error` is the explicit failure sentinel.
#[derive(Debug, Clone, Default)]
pub struct LlmDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub error: Option<String>,
}

/// Fragment of a tool call accumulated across deltas, keyed by index.
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Voice-activity detector.
///
/// `reset` must be called before each query window; instances are pooled
/// and may move between sessions.
pub trait VadProvider: Send {
    fn reset(&mut self);
    fn is_voice(&mut self, pcm: &[f32], sample_rate: u32, frame_size: usize) -> Result<bool>;
}

/// Streaming speech recognizer.
///
/// Lazy connection is normative: the provider must not open its upstream
/// connection until the first PCM chunk arrives, with bounded retries on
/// connect/handshake failure.
pub trait AsrProvider: Send {
    fn streaming_recognize(
        &mut self,
        cancel: CancellationToken,
        pcm_rx: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    ) -> Result<mpsc::Receiver<AsrEvent>>;
}

/// Streaming chat-completion provider.
pub trait LlmProvider: Send {
    fn response_with_context(
        &mut self,
        cancel: CancellationToken,
        session_id: &str,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<LlmDelta>;
}

/// Streaming speech synthesizer yielding encoded output frames.
pub trait TtsProvider: Send {
    fn text_to_speech_stream(
        &mut self,
        cancel: CancellationToken,
        text: &str,
        format: AudioFormat,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// The pool key already discriminates voices; this lets an instance
    /// confirm the voice it was keyed for.
    fn set_voice(&mut self, _voice: &str) {}
}
