//! Core dialogue types shared across the pipeline
//!
//! A session's conversation is an ordered list of [`Message`]s guarded by a
//! read/write lock: the session controller appends, the LLM request builder
//! reads a bounded, tool-aligned tail.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments. Kept as a string so provider quirks
    /// (object vs. stringified object) normalize at the wire layer.
    pub arguments: String,
}

/// One dialogue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Free-form annotations, e.g. `{"interrupted": true, "stage": "llm"}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
    /// Creation time, unix milliseconds.
    pub time_ms: i64,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            extra: None,
            time_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut m = Self::base(Role::Assistant, content);
        m.tool_calls = Some(tool_calls);
        m
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(Role::Tool, content);
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Annotate this message as cut short by a user interruption.
    pub fn mark_interrupted(&mut self, stage: &str) {
        let extra = self.extra.get_or_insert_with(Map::new);
        extra.insert("interrupted".into(), Value::Bool(true));
        extra.insert("interrupted_by".into(), Value::String("user".into()));
        extra.insert("stage".into(), Value::String(stage.into()));
    }
}

/// Deterministic 32-hex message identifier.
///
/// Derived from `(session_id, role, time_ms)` so the two persistence phases
/// of a message address the same row.
pub fn message_id(session_id: &str, role: Role, time_ms: i64) -> String {
    format!("{:x}", md5::compute(format!("{}{}{}", session_id, role.as_str(), time_ms)))
}

/// Ordered conversation history with mutex-protected append and bounded,
/// tool-aligned tail reads.
#[derive(Default)]
pub struct Dialogue {
    inner: RwLock<Vec<Message>>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.inner.write().unwrap().push(message);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last `n` messages, verbatim.
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let guard = self.inner.read().unwrap();
        let start = guard.len().saturating_sub(n);
        guard[start..].to_vec()
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        let guard = self.inner.read().unwrap();
        guard
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
    }

    /// Last `n` messages with the tool-alignment invariant enforced.
    ///
    /// A `tool` message survives only if an earlier `assistant` message in
    /// the slice carries its `tool_call_id`. An assistant tool call with no
    /// surviving `tool` reply is dropped from the request (the stored
    /// dialogue keeps everything for audit). Assistant messages left with
    /// neither content nor calls are removed.
    pub fn aligned_tail(&self, n: usize) -> Vec<Message> {
        let tail = self.recent(n);

        // Pass 1: which tool replies answer which assistant call ids.
        let mut answered: std::collections::HashSet<String> = std::collections::HashSet::new();
        {
            let mut seen_calls: std::collections::HashSet<String> = std::collections::HashSet::new();
            for m in &tail {
                match m.role {
                    Role::Assistant => {
                        if let Some(calls) = &m.tool_calls {
                            for c in calls {
                                seen_calls.insert(c.id.clone());
                            }
                        }
                    }
                    Role::Tool => {
                        if let Some(id) = &m.tool_call_id {
                            if seen_calls.contains(id) {
                                answered.insert(id.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // Pass 2: rebuild the slice under the invariant.
        let mut out = Vec::with_capacity(tail.len());
        for mut m in tail {
            match m.role {
                Role::Assistant => {
                    if let Some(calls) = m.tool_calls.take() {
                        let kept: Vec<ToolCall> =
                            calls.into_iter().filter(|c| answered.contains(&c.id)).collect();
                        if !kept.is_empty() {
                            m.tool_calls = Some(kept);
                        }
                    }
                    if m.content.is_empty() && !m.has_tool_calls() {
                        continue;
                    }
                    out.push(m);
                }
                Role::Tool => {
                    let keep = m
                        .tool_call_id
                        .as_ref()
                        .map(|id| answered.contains(id))
                        .unwrap_or(false);
                    if keep {
                        out.push(m);
                    }
                }
                _ => out.push(m),
            }
        }
        out
    }
}

/// Negotiated audio stream parameters for one direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

impl AudioFormat {
    /// Samples per channel in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }
}

/// Audio attached to a persistence event.
#[derive(Debug, Clone)]
pub enum AudioData {
    /// Raw little-endian float32 PCM bytes (user utterances).
    PcmF32(Vec<u8>),
    /// Encoded Opus frames in send order (assistant turns).
    OpusFrames(Vec<Vec<u8>>),
}

/// Two-phase chat-history persistence event.
///
/// Phase 1 (`is_update == false`) inserts the text row; phase 2
/// (`is_update == true`) attaches audio to the same `message_id`.
#[derive(Debug, Clone)]
pub struct AddMessageEvent {
    pub session_id: String,
    pub device_id: String,
    pub agent_id: String,
    pub message: Message,
    pub message_id: String,
    pub audio: Option<AudioData>,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_update: bool,
}

/// Session teardown notification consumed by the history workers.
#[derive(Debug, Clone)]
pub struct SessionEndEvent {
    pub session_id: String,
    pub device_id: String,
    pub agent_id: String,
}

/// Published when the user (by exit words) or a tool ends the conversation.
#[derive(Debug, Clone)]
pub struct ExitChatEvent {
    pub session_id: String,
    pub device_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_deterministic() {
        let a = message_id("sess-1", Role::User, 1700000000123);
        let b = message_id("sess-1", Role::User, 1700000000123);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_message_id_varies_by_role() {
        let user = message_id("sess-1", Role::User, 42);
        let assistant = message_id("sess-1", Role::Assistant, 42);
        assert_ne!(user, assistant);
    }

    #[test]
    fn test_dialogue_recent_bounded() {
        let d = Dialogue::new();
        for i in 0..20 {
            d.push(Message::user(format!("msg {}", i)));
        }
        let tail = d.recent(5);
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0].content, "msg 15");
    }

    #[test]
    fn test_aligned_tail_drops_orphan_tool_message() {
        let d = Dialogue::new();
        d.push(Message::user("turn on the light"));
        // Tool reply whose call id was never issued in this window.
        d.push(Message::tool_result("call_missing", "ok"));
        let tail = d.aligned_tail(10);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].role, Role::User);
    }

    #[test]
    fn test_aligned_tail_drops_unanswered_call() {
        let d = Dialogue::new();
        d.push(Message::assistant_with_tools(
            "",
            vec![
                ToolCall {
                    id: "call_1".into(),
                    name: "lights".into(),
                    arguments: "{}".into(),
                },
                ToolCall {
                    id: "call_2".into(),
                    name: "music".into(),
                    arguments: "{}".into(),
                },
            ],
        ));
        d.push(Message::tool_result("call_1", "done"));
        let tail = d.aligned_tail(10);
        assert_eq!(tail.len(), 2);
        let calls = tail[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
    }

    #[test]
    fn test_aligned_tail_drops_empty_assistant() {
        let d = Dialogue::new();
        d.push(Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_9".into(),
                name: "lights".into(),
                arguments: "{}".into(),
            }],
        ));
        // No tool reply at all: the assistant message has nothing left.
        let tail = d.aligned_tail(10);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_aligned_tail_keeps_well_formed_pair() {
        let d = Dialogue::new();
        d.push(Message::user("weather?"));
        d.push(Message::assistant_with_tools(
            "checking",
            vec![ToolCall {
                id: "call_w".into(),
                name: "weather".into(),
                arguments: r#"{"city":"Berlin"}"#.into(),
            }],
        ));
        d.push(Message::tool_result("call_w", "sunny"));
        d.push(Message::assistant("It is sunny."));
        let tail = d.aligned_tail(10);
        assert_eq!(tail.len(), 4);
    }

    #[test]
    fn test_mark_interrupted() {
        let mut m = Message::assistant("partial answ");
        m.mark_interrupted("llm");
        let extra = m.extra.unwrap();
        assert_eq!(extra.get("interrupted"), Some(&Value::Bool(true)));
        assert_eq!(extra.get("stage").and_then(|v| v.as_str()), Some("llm"));
    }

    #[test]
    fn test_audio_format_samples_per_frame() {
        let f = AudioFormat {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 20,
        };
        assert_eq!(f.samples_per_frame(), 320);
        let f = AudioFormat {
            sample_rate: 24000,
            channels: 1,
            frame_duration_ms: 60,
        };
        assert_eq!(f.samples_per_frame(), 1440);
    }
}
