//! LLM turn driver
//!
//! One logical turn per committed user utterance. A turn recurses through
//! tool calls: the assistant's calls run, their results join the dialogue
//! as `tool` messages, and the model is re-invoked at `nest + 1` until a
//! plain-text response (or an audio-producing/terminal tool) ends it. Only
//! the outermost level frames the audio with TtsStart/TtsStop, so the user
//! hears one continuous assistant turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::asr::ChatText;
use super::state::{SessionCore, SessionStatus};
use super::tts::{TtsItem, TtsManager};
use crate::audio::stream::{decode_pcm_s16le, mp3_to_opus_frames, OpusReencoder};
use crate::audio::wav::wav_to_pcm_f32;
use crate::events::BusEvent;
use crate::sync::BoundedQueue;
use crate::tools::resource::PagedFetcher;
use crate::tools::{Operator, ToolAction, ToolOutput, ToolRegistry};
use crate::types::{ExitChatEvent, Message, ToolCall};

/// Sentence bounds for the TTS feed.
const MIN_SENTENCE_CHARS: usize = 2;
const MAX_SENTENCE_CHARS: usize = 100;

/// Splits streamed deltas into speakable sentences.
pub struct SentenceSplitter {
    buffer: String,
    min_chars: usize,
    max_chars: usize,
}

fn is_sentence_boundary(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '\n' | '。' | '！' | '？' | '；' | '…')
}

impl SentenceSplitter {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
            max_chars,
        }
    }

    /// Feed a delta; returns any sentences now complete.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut out = Vec::new();
        for c in delta.chars() {
            self.buffer.push(c);
            let len = self.buffer.chars().count();
            if (is_sentence_boundary(c) && len >= self.min_chars) || len >= self.max_chars {
                let sentence = self.buffer.trim().to_string();
                self.buffer.clear();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
            }
        }
        out
    }

    /// Remaining partial sentence at stream end.
    pub fn flush(&mut self) -> Option<String> {
        let tail = self.buffer.trim().to_string();
        self.buffer.clear();
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

/// Assembles tool calls from index-keyed stream fragments.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, (String, String, String)>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, deltas: &[crate::providers::ToolCallDelta]) {
        for d in deltas {
            let entry = self.calls.entry(d.index).or_default();
            if let Some(id) = &d.id {
                entry.0 = id.clone();
            }
            if let Some(name) = &d.name {
                entry.1 = name.clone();
            }
            entry.2.push_str(&d.arguments);
        }
    }

    fn finalize(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| ToolCall {
                id,
                name,
                arguments,
            })
            .collect()
    }
}

/// Carries turn-scoped state across tool-call recursion levels (an explicit
/// carrier instead of context-smuggled values).
struct TurnAccumulator {
    /// Whether any sentence reached the TTS feed yet (first one is tagged).
    sent_any: bool,
    /// Set by a terminal tool; spoken before closing.
    exit_farewell: Option<String>,
    /// Inline/linked tool audio suspended LLM continuation.
    audio_suspended: bool,
}

pub struct LlmManager {
    core: Arc<SessionCore>,
    tts: TtsManager,
    registry: ToolRegistry,
    operator: Arc<dyn Operator>,
    chat_queue: Arc<BoundedQueue<ChatText>>,
}

impl LlmManager {
    pub fn new(
        core: Arc<SessionCore>,
        tts: TtsManager,
        registry: ToolRegistry,
        operator: Arc<dyn Operator>,
        chat_queue: Arc<BoundedQueue<ChatText>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            tts,
            registry,
            operator,
            chat_queue,
        })
    }

    /// Dispatcher: consumes committed utterances and runs one turn each.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let token = manager.core.session_token.clone();
            loop {
                let chat = match manager.chat_queue.pop(&token).await {
                    Ok(chat) => chat,
                    Err(_) => break,
                };
                if manager.is_exit_phrase(&chat.text) {
                    manager.handle_exit(&chat.text, None).await;
                    continue;
                }
                manager.run_turn(chat).await;
                if manager.core.exit_requested.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
            }
            debug!("LLM dispatcher stopped");
        })
    }

    fn is_exit_phrase(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.core
            .config
            .chat
            .exit_words
            .iter()
            .any(|w| !w.is_empty() && lowered.contains(&w.to_lowercase()))
    }

    /// Publish exit, speak the farewell, ask the controller to close.
    async fn handle_exit(&self, reason: &str, farewell: Option<String>) {
        self.core.bus.publish(BusEvent::ExitChat(ExitChatEvent {
            session_id: self.core.session_id.clone(),
            device_id: self.core.device_id.clone(),
            reason: reason.to_string(),
        }));
        self.core
            .exit_requested
            .store(true, std::sync::atomic::Ordering::Release);

        let farewell = farewell.unwrap_or_else(|| self.core.config.chat.farewell.clone());
        let (done_tx, done_rx) = oneshot::channel();
        let spoken = self
            .tts
            .enqueue(TtsItem::sentence(farewell, true).with_on_end(done_tx))
            .is_ok();
        let _ = self.tts.enqueue(TtsItem::end());
        if spoken {
            // Bounded: close even if the farewell never finishes playing.
            let _ =
                tokio::time::timeout(std::time::Duration::from_secs(10), done_rx).await;
        }
        self.core.close_notify.notify_one();
    }

    async fn run_turn(&self, chat: ChatText) {
        let token = self.core.after_asr.get();
        self.core.set_status(SessionStatus::LlmStart);

        let mut turn = TurnAccumulator {
            sent_any: false,
            exit_farewell: None,
            audio_suspended: false,
        };

        let result = self.chat_turn(&token, 0, &chat, &mut turn).await;

        // Close the turn's audio framing exactly once, at the outer level.
        if turn.sent_any {
            if let Err(e) = self.tts.enqueue(TtsItem::end()) {
                debug!(error = %e, "turn end marker dropped");
            }
        }

        match result {
            Ok(()) => {}
            Err(e) if token.is_cancelled() => {
                debug!(error = %e, "turn ended by interruption");
            }
            Err(e) => {
                warn!(error = %e, "LLM turn failed");
            }
        }

        if let Some(farewell) = turn.exit_farewell.take() {
            self.handle_exit("exit_conversation tool", Some(farewell)).await;
        }
    }

    /// One recursion level of the turn.
    fn chat_turn<'a>(
        &'a self,
        token: &'a CancellationToken,
        nest: usize,
        chat: &'a ChatText,
        turn: &'a mut TurnAccumulator,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            const MAX_NEST: usize = 8;
            if nest > MAX_NEST {
                bail!("tool recursion exceeded {} levels", MAX_NEST);
            }

            let messages = self.build_prompt(chat);
            let tool_defs = self.registry.definitions();

            let mut provider = self
                .core
                .pools
                .llm
                .acquire(&self.core.device_config.llm)
                .await
                .context("LLM acquire failed")?;
            let mut rx = provider.get_mut().response_with_context(
                token.clone(),
                &self.core.session_id,
                messages,
                tool_defs,
            );

            let mut splitter = SentenceSplitter::new(MIN_SENTENCE_CHARS, MAX_SENTENCE_CHARS);
            let mut accumulator = ToolCallAccumulator::default();
            let mut full_text = String::new();
            let mut stream_error: Option<String> = None;

            loop {
                let delta = tokio::select! {
                    d = rx.recv() => d,
                    _ = token.cancelled() => {
                        self.core.pools.llm.release(provider);
                        self.save_interrupted(&full_text);
                        return Ok(());
                    }
                };
                let Some(delta) = delta else { break };
                if let Some(err) = delta.error {
                    stream_error = Some(err);
                    break;
                }
                if let Some(content) = delta.content {
                    full_text.push_str(&content);
                    for sentence in splitter.push(&content) {
                        self.emit_sentence(turn, sentence);
                    }
                }
                if !delta.tool_calls.is_empty() {
                    accumulator.absorb(&delta.tool_calls);
                }
            }

            if let Some(err) = stream_error {
                // Stream died mid-request; the instance may be wedged.
                self.core.pools.llm.discard(provider);
                bail!("LLM stream failed: {}", err);
            }
            self.core.pools.llm.release(provider);

            if let Some(tail) = splitter.flush() {
                self.emit_sentence(turn, tail);
            }

            let tool_calls = accumulator.finalize();
            if tool_calls.is_empty() {
                // Plain final response. Empty assistant text without tool
                // calls is never persisted.
                if !full_text.trim().is_empty() {
                    self.core
                        .commit_message(Message::assistant(full_text.trim()), None);
                }
                return Ok(());
            }

            info!(count = tool_calls.len(), nest, "executing tool calls");
            self.core.commit_message(
                Message::assistant_with_tools(full_text.trim(), tool_calls.clone()),
                None,
            );

            for call in &tool_calls {
                self.execute_tool(token, call, turn).await;
                if turn.exit_farewell.is_some() {
                    return Ok(());
                }
            }

            if turn.audio_suspended {
                // Tool audio replaced the continuation; the dialogue is not
                // continued this turn.
                return Ok(());
            }
            self.chat_turn(token, nest + 1, chat, turn).await
        })
    }

    fn emit_sentence(&self, turn: &mut TurnAccumulator, sentence: String) {
        let is_start = !turn.sent_any;
        turn.sent_any = true;
        if let Err(e) = self.tts.enqueue(TtsItem::sentence(sentence, is_start)) {
            warn!(error = %e, "TTS item queue rejected sentence");
        }
    }

    /// Persist partial assistant text when a turn is cut off mid-stream, so
    /// subsequent turns see the interruption.
    fn save_interrupted(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut message = Message::assistant(text);
        message.mark_interrupted("llm");
        self.core.commit_message(message, None);
    }

    async fn execute_tool(
        &self,
        token: &CancellationToken,
        call: &ToolCall,
        turn: &mut TurnAccumulator,
    ) {
        let Some(handler) = self.registry.resolve(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            self.core.commit_message(
                Message::tool_result(&call.id, format!("Error: unknown tool {}", call.name)),
                None,
            );
            return;
        };

        let arguments: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));
        let output = match handler.invoke(self.operator.as_ref(), arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool invocation failed");
                self.core.commit_message(
                    Message::tool_result(&call.id, format!("Error: {}", e)),
                    None,
                );
                return;
            }
        };

        match output {
            ToolOutput::Text(text) => {
                self.core
                    .commit_message(Message::tool_result(&call.id, text), None);
            }
            ToolOutput::InlineAudio { data, mime } => {
                match self.transcode_tool_audio(&data, &mime) {
                    Ok(frames) => {
                        let _ = self.tts.enqueue(TtsItem::frames(call.name.clone(), frames));
                        turn.sent_any = true;
                        turn.audio_suspended = true;
                        self.core.commit_message(
                            Message::tool_result(&call.id, "[audio played]"),
                            None,
                        );
                    }
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool audio decode failed");
                        self.core.commit_message(
                            Message::tool_result(&call.id, format!("Error: {}", e)),
                            None,
                        );
                    }
                }
            }
            ToolOutput::ResourceLink { url, mime } => {
                let fetcher = PagedFetcher::default();
                match fetcher.fetch_all(&url, token).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        let mime = mime.unwrap_or_else(|| "audio/mpeg".to_string());
                        match self.transcode_tool_audio(&bytes, &mime) {
                            Ok(frames) => {
                                let _ = self
                                    .tts
                                    .enqueue(TtsItem::frames(call.name.clone(), frames));
                                turn.sent_any = true;
                                turn.audio_suspended = true;
                                self.core.commit_message(
                                    Message::tool_result(&call.id, "[audio streamed]"),
                                    None,
                                );
                            }
                            Err(e) => {
                                self.core.commit_message(
                                    Message::tool_result(&call.id, format!("Error: {}", e)),
                                    None,
                                );
                            }
                        }
                    }
                    Ok(_) => {
                        self.core.commit_message(
                            Message::tool_result(&call.id, "Error: empty resource"),
                            None,
                        );
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "resource fetch failed");
                        self.core.commit_message(
                            Message::tool_result(&call.id, format!("Error: {}", e)),
                            None,
                        );
                    }
                }
            }
            ToolOutput::Action(ToolAction::ExitConversation { farewell }) => {
                self.core.commit_message(
                    Message::tool_result(&call.id, "conversation ended"),
                    None,
                );
                turn.exit_farewell =
                    Some(farewell.unwrap_or_else(|| self.core.config.chat.farewell.clone()));
            }
        }
    }

    fn transcode_tool_audio(&self, data: &[u8], mime: &str) -> Result<Vec<Vec<u8>>> {
        let format = self.core.output_format;
        if mime.contains("wav") {
            let (pcm, rate, channels) = wav_to_pcm_f32(data)?;
            let mono = crate::audio::downmix_to_mono(&pcm, channels);
            let mut reencoder = OpusReencoder::new(format)?;
            let mut frames = reencoder.push_pcm(&mono, rate)?;
            frames.extend(reencoder.finish()?);
            Ok(frames)
        } else if mime.contains("pcm") {
            let pcm = decode_pcm_s16le(data);
            let mut reencoder = OpusReencoder::new(format)?;
            let mut frames = reencoder.push_pcm(&pcm, format.sample_rate)?;
            frames.extend(reencoder.finish()?);
            Ok(frames)
        } else {
            mp3_to_opus_frames(data, format)
        }
    }

    /// Prompt assembly: system prompt + current time + long-memory context
    /// + speaker description + knowledge-base routing policy, then the
    /// aligned dialogue tail ending in the current user message.
    fn build_prompt(&self, chat: &ChatText) -> Vec<Message> {
        let mut system = self.core.config.chat.system_prompt.clone();
        system.push_str(&format!(
            "\nCurrent date and time: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(context) = self.core.memory_context.lock().unwrap().as_ref() {
            system.push_str("\nWhat you remember about this user:\n");
            system.push_str(context);
        }
        if let Some(prompt) = self.core.speaker_prompt.lock().unwrap().as_ref() {
            system.push_str("\nThe current speaker: ");
            system.push_str(prompt);
        }
        if !self.core.device_config.knowledge_bases.is_empty() {
            system.push_str(
                "\nBefore answering factual questions, call search_knowledge with the \
                 fitting base:",
            );
            for kb in &self.core.device_config.knowledge_bases {
                system.push_str(&format!("\n- {}: {}", kb.name, kb.description));
            }
        }

        let mut messages = vec![Message::system(system)];
        let history = self
            .core
            .dialogue
            .aligned_tail(self.core.config.chat.max_history);
        let tail_is_current = history
            .last()
            .map(|m| m.role == crate::types::Role::User && m.content == chat.text)
            .unwrap_or(false);
        messages.extend(history);
        if !tail_is_current {
            messages.push(Message::user(chat.text.clone()));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_basic_sentences() {
        let mut s = SentenceSplitter::new(2, 100);
        let mut out = s.push("Hello there. How are");
        out.extend(s.push(" you today? I"));
        assert_eq!(out, vec!["Hello there.", "How are you today?"]);
        assert_eq!(s.flush().as_deref(), Some("I"));
    }

    #[test]
    fn test_splitter_min_length_defers_split() {
        let mut s = SentenceSplitter::new(2, 100);
        // A lone period is below the minimum; it carries into the next chunk.
        let out = s.push(".");
        assert!(out.is_empty());
        let out = s.push("Ok.");
        assert_eq!(out, vec![".Ok."]);
    }

    #[test]
    fn test_splitter_max_length_forces_split() {
        let mut s = SentenceSplitter::new(2, 10);
        let out = s.push("abcdefghijklmnopqrst");
        assert_eq!(out, vec!["abcdefghij", "klmnopqrst"]);
    }

    #[test]
    fn test_splitter_cjk_boundaries() {
        let mut s = SentenceSplitter::new(2, 100);
        let out = s.push("你好。今天天气不错！");
        assert_eq!(out, vec!["你好。", "今天天气不错！"]);
    }

    #[test]
    fn test_accumulator_merges_fragments() {
        use crate::providers::ToolCallDelta;
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&[ToolCallDelta {
            index: 0,
            id: Some("call_1".into()),
            name: Some("lights".into()),
            arguments: "{\"on\"".into(),
        }]);
        acc.absorb(&[ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: ":true}".into(),
        }]);
        let calls = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, "{\"on\":true}");
    }

    #[test]
    fn test_accumulator_drops_nameless_fragments() {
        use crate::providers::ToolCallDelta;
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&[ToolCallDelta {
            index: 0,
            id: Some("x".into()),
            name: None,
            arguments: "{}".into(),
        }]);
        assert!(acc.finalize().is_empty());
    }
}
