//! Streaming speaker identification
//!
//! Optional sidecar to ASR: fed the same PCM in parallel, asked for a
//! verdict when the utterance ends. The WebSocket connection persists
//! across utterances and is health-checked by a ping before reuse. Results
//! land in a one-shot pending slot the ASR commit step reads with a short
//! bounded wait; anything late degrades to `None`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use super::state::{SessionCore, SpeakerResult};

enum SpeakerCmd {
    Pcm(Vec<f32>),
    Finish,
    /// Liveness probe before reuse.
    Ping,
}

struct Shared {
    pending: Mutex<Option<SpeakerResult>>,
    ready: Notify,
}

pub struct SpeakerManager {
    core: Arc<SessionCore>,
    enabled: bool,
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<mpsc::Sender<SpeakerCmd>>>,
}

fn ws_url(base_url: &str, sample_rate: u32, agent_id: &str, threshold: f32) -> String {
    let ws_base = base_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!(
        "{}/api/v1/speaker/identify_ws?sample_rate={}&agent_id={}&threshold={}",
        ws_base.trim_end_matches('/'),
        sample_rate,
        agent_id,
        threshold
    )
}

fn f32_to_le_bytes(pcm: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 4);
    for s in pcm {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub(crate) fn parse_result_frame(raw: &str) -> Option<SpeakerResult> {
    let value: Value = serde_json::from_str(raw).ok()?;
    if value.get("type")?.as_str()? != "result" {
        return None;
    }
    serde_json::from_value(value.get("result")?.clone()).ok()
}

impl SpeakerManager {
    pub fn new(core: Arc<SessionCore>) -> Self {
        let enabled = core.config.voice_identify.enable
            && !core.config.voice_identify.base_url.is_empty();
        Self {
            core,
            enabled,
            shared: Arc::new(Shared {
                pending: Mutex::new(None),
                ready: Notify::new(),
            }),
            cmd_tx: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Prepare for a new utterance: clear stale results and make sure a
    /// live connection exists.
    pub async fn start_utterance(&self) {
        if !self.enabled {
            return;
        }
        *self.shared.pending.lock().unwrap() = None;

        // Health-check an existing connection before trusting it.
        let alive = {
            let guard = self.cmd_tx.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => tx.try_send(SpeakerCmd::Ping).is_ok(),
                None => false,
            }
        };
        if alive {
            return;
        }
        self.connect().await;
    }

    async fn connect(&self) {
        let sample_rate = self.core.input_format.lock().unwrap().sample_rate;
        let url = ws_url(
            &self.core.config.voice_identify.base_url,
            sample_rate,
            &self.core.agent_id,
            self.core.config.voice_identify.threshold,
        );
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SpeakerCmd>(64);
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);

        let shared = self.shared.clone();
        let session_token = self.core.session_token.clone();
        tokio::spawn(async move {
            let mut ws = match connect_async(url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    warn!(error = %e, "speaker service connect failed");
                    return;
                }
            };
            debug!("speaker identification stream connected");

            loop {
                tokio::select! {
                    _ = session_token.cancelled() => break,
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(SpeakerCmd::Pcm(pcm)) => {
                                if ws.send(WsMessage::Binary(f32_to_le_bytes(&pcm).into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(SpeakerCmd::Finish) => {
                                if ws.send(WsMessage::Text(r#"{"action":"finish"}"#.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(SpeakerCmd::Ping) => {
                                if ws.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(raw))) => {
                                if let Some(result) = parse_result_frame(&raw) {
                                    *shared.pending.lock().unwrap() = Some(result);
                                    shared.ready.notify_one();
                                }
                                // {"type":"connection"} and other frames are
                                // informational.
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "speaker stream error");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = ws.close(None).await;
            debug!("speaker identification stream closed");
        });
    }

    /// Feed utterance PCM; drops silently when the sidecar is saturated.
    pub fn add_pcm(&self, pcm: &[f32]) {
        if !self.enabled {
            return;
        }
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(SpeakerCmd::Pcm(pcm.to_vec()));
        }
    }

    /// Utterance ended: ask the service to produce its verdict.
    pub fn finish_and_identify(&self) {
        if !self.enabled {
            return;
        }
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(SpeakerCmd::Finish);
        }
    }

    /// Bounded read of the pending verdict. `None` when identification is
    /// off, late, or failed.
    pub async fn take_result(&self, wait: Duration) -> Option<SpeakerResult> {
        if !self.enabled {
            return None;
        }
        if let Some(result) = self.shared.pending.lock().unwrap().take() {
            return Some(result);
        }
        let _ = tokio::time::timeout(wait, self.shared.ready.notified()).await;
        self.shared.pending.lock().unwrap().take()
    }

    pub fn close(&self) {
        *self.cmd_tx.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_shape() {
        let url = ws_url("https://voice.example.com", 16000, "agent-7", 0.6);
        assert!(url.starts_with("wss://voice.example.com/api/v1/speaker/identify_ws?"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("agent_id=agent-7"));
        assert!(url.contains("threshold=0.6"));
    }

    #[test]
    fn test_parse_result_frame() {
        let raw = r#"{"type":"result","result":{"identified":true,"speaker_id":"sp1","speaker_name":"Ada","confidence":0.92,"threshold":0.6}}"#;
        let result = parse_result_frame(raw).unwrap();
        assert!(result.identified);
        assert_eq!(result.speaker_name.as_deref(), Some("Ada"));
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_parse_non_result_frames_ignored() {
        assert!(parse_result_frame(r#"{"type":"connection"}"#).is_none());
        assert!(parse_result_frame("junk").is_none());
    }

    #[test]
    fn test_f32_le_bytes_length() {
        assert_eq!(f32_to_le_bytes(&[0.0, 1.0]).len(), 8);
    }
}
