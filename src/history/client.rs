//! History service HTTP client
//!
//! Two-phase persistence: `POST …/messages` inserts the text row,
//! `PUT …/messages/{id}/audio` attaches audio later. Audio travels as
//! base64 WAV; when WAV conversion fails the raw bytes go up instead so
//! nothing is lost. Transient failures retry with exponential backoff.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::audio::wav;
use crate::config::HistoryConfig;
use crate::types::{AddMessageEvent, AudioData, Message, Role};

pub struct HistoryService {
    client: Client,
    base_url: String,
    max_retries: u32,
}

/// Encoded audio ready for the wire.
struct WireAudio {
    data_b64: String,
    format: &'static str,
    size: usize,
}

fn encode_audio(ev: &AddMessageEvent) -> Option<WireAudio> {
    let audio = ev.audio.as_ref()?;
    let wav_bytes = match audio {
        AudioData::PcmF32(bytes) => {
            let samples = wav::pcm_bytes_to_f32(bytes);
            wav::pcm_f32_to_wav(&samples, ev.sample_rate, ev.channels)
        }
        AudioData::OpusFrames(frames) => {
            wav::opus_frames_to_wav(frames, ev.sample_rate, ev.channels)
        }
    };
    match wav_bytes {
        Ok(bytes) => Some(WireAudio {
            size: bytes.len(),
            data_b64: BASE64.encode(&bytes),
            format: "wav",
        }),
        Err(e) => {
            warn!(error = %e, "WAV conversion failed, sending raw audio");
            let raw: Vec<u8> = match audio {
                AudioData::PcmF32(bytes) => bytes.clone(),
                AudioData::OpusFrames(frames) => frames.concat(),
            };
            Some(WireAudio {
                size: raw.len(),
                data_b64: BASE64.encode(&raw),
                format: "raw",
            })
        }
    }
}

fn metadata_of(message: &Message) -> Value {
    message
        .extra
        .as_ref()
        .map(|m| Value::Object(m.clone()))
        .unwrap_or_else(|| json!({}))
}

impl HistoryService {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build history HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Phase 1: insert the message row (text, and audio when already known).
    pub async fn save_message(&self, ev: &AddMessageEvent) -> Result<()> {
        let mut body = json!({
            "messageId": ev.message_id,
            "deviceId": ev.device_id,
            "agentId": ev.agent_id,
            "sessionId": ev.session_id,
            "role": ev.message.role.as_str(),
            "content": ev.message.content,
            "metadata": metadata_of(&ev.message),
        });
        if let Some(id) = &ev.message.tool_call_id {
            body["toolCallId"] = Value::String(id.clone());
        }
        if let Some(calls) = &ev.message.tool_calls {
            body["toolCallsJson"] =
                Value::String(serde_json::to_string(calls).unwrap_or_default());
        }
        if let Some(audio) = encode_audio(ev) {
            body["audioData"] = Value::String(audio.data_b64);
            body["audioFormat"] = Value::String(audio.format.to_string());
            body["audioSize"] = Value::from(audio.size);
        }

        let url = format!("{}/api/internal/history/messages", self.base_url);
        self.post_with_backoff(&url, &body).await
    }

    /// Phase 2: attach audio to an already-inserted message.
    pub async fn update_audio(&self, ev: &AddMessageEvent) -> Result<()> {
        let Some(audio) = encode_audio(ev) else {
            debug!(message_id = %ev.message_id, "audio update event carries no audio, skipping");
            return Ok(());
        };
        let body = json!({
            "audioData": audio.data_b64,
            "audioFormat": audio.format,
            "audioSize": audio.size,
            "metadata": metadata_of(&ev.message),
        });
        let url = format!(
            "{}/api/internal/history/messages/{}/audio",
            self.base_url, ev.message_id
        );
        self.put_with_backoff(&url, &body).await
    }

    /// Recent messages for a device+agent, chronological order.
    pub async fn fetch_recent(
        &self,
        device_id: &str,
        agent_id: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut url = format!(
            "{}/api/internal/history/messages?device_id={}&agent_id={}&limit={}",
            self.base_url, device_id, agent_id, limit
        );
        if let Some(sid) = session_id {
            url.push_str(&format!("&session_id={}", sid));
        }
        let response = self.client.get(&url).send().await.context("history fetch failed")?;
        if !response.status().is_success() {
            bail!("history fetch returned {}", response.status());
        }
        let rows: Vec<Value> = response.json().await.context("history fetch parse failed")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let role = match row.get("role")?.as_str()? {
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    "system" => Role::System,
                    "tool" => Role::Tool,
                    _ => return None,
                };
                let content = row.get("content")?.as_str()?.to_string();
                let mut message = Message::base_for_fetch(role, content);
                if let Some(id) = row.get("toolCallId").and_then(|v| v.as_str()) {
                    message.tool_call_id = Some(id.to_string());
                }
                Some(message)
            })
            .collect())
    }

    async fn post_with_backoff(&self, url: &str, body: &Value) -> Result<()> {
        self.send_with_backoff(|| self.client.post(url).json(body)).await
    }

    async fn put_with_backoff(&self, url: &str, body: &Value) -> Result<()> {
        self.send_with_backoff(|| self.client.put(url).json(body)).await
    }

    async fn send_with_backoff<F>(&self, build: F) -> Result<()>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = build().send().await;
            match result {
                Ok(r) if r.status().is_success() => return Ok(()),
                Ok(r) if attempt < self.max_retries => {
                    warn!(status = %r.status(), attempt, "history request failed, retrying");
                }
                Ok(r) => bail!("history request failed with status {}", r.status()),
                Err(e) if attempt < self.max_retries => {
                    warn!(error = %e, attempt, "history request errored, retrying");
                }
                Err(e) => return Err(e).context("history request failed"),
            }
            attempt += 1;
            let delay = Duration::from_millis(500 * 2u64.pow(attempt.min(4)));
            tokio::time::sleep(delay).await;
        }
    }
}

impl Message {
    /// Constructor used when rehydrating rows from the history service.
    fn base_for_fetch(role: Role, content: String) -> Message {
        let mut m = match role {
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            Role::System => Message::system(content),
            Role::Tool => Message::tool_result("", content),
        };
        if role == Role::Tool {
            m.tool_call_id = None;
        }
        m
    }
}
