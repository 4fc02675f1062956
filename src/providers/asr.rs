//! WebSocket streaming speech recognizer
//!
//! The upstream connection is opened lazily on the first non-empty PCM
//! chunk: recognizer servers drop idle connections, so connecting at
//! acquire time would burn the handshake on utterances that never come.
//! Connect and handshake failures retry a bounded number of times.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AsrEvent, AsrProvider};
use crate::config::AsrProviderConfig;

/// Wire result frame from the recognizer service.
#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    error: Option<String>,
}

pub(crate) fn parse_result(raw: &str) -> Option<AsrEvent> {
    serde_json::from_str::<WireResult>(raw)
        .ok()
        .map(|w| AsrEvent {
            text: w.text,
            is_final: w.is_final,
            error: w.error,
        })
}

/// Interleave f32 samples into the little-endian s16 frames the service
/// consumes.
pub(crate) fn f32_to_s16le(pcm: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for &s in pcm {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub struct WsAsr {
    config: AsrProviderConfig,
}

impl WsAsr {
    pub fn new(config: AsrProviderConfig) -> Self {
        Self { config }
    }

    async fn connect_with_retries(
        config: &AsrProviderConfig,
        sample_rate: u32,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let mut attempt = 0;
        loop {
            match Self::connect_once(config, sample_rate).await {
                Ok(ws) => return Ok(ws),
                Err(e) if attempt < config.connect_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "ASR connect failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(
        config: &AsrProviderConfig,
        sample_rate: u32,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let (mut ws, _) = connect_async(config.ws_url.as_str())
            .await
            .context("ASR WebSocket connect failed")?;
        let start = serde_json::json!({
            "action": "start",
            "sample_rate": sample_rate,
            "format": "pcm_s16le",
            "api_key": config.api_key,
        });
        ws.send(WsMessage::Text(start.to_string().into()))
            .await
            .context("ASR handshake failed")?;
        Ok(ws)
    }
}

impl AsrProvider for WsAsr {
    fn streaming_recognize(
        &mut self,
        cancel: CancellationToken,
        mut pcm_rx: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    ) -> Result<mpsc::Receiver<AsrEvent>> {
        let (event_tx, event_rx) = mpsc::channel(32);
        let config = self.config.clone();

        tokio::spawn(async move {
            // Lazy connect: hold off until the first real audio chunk.
            let first = tokio::select! {
                chunk = pcm_rx.recv() => chunk,
                _ = cancel.cancelled() => None,
            };
            let Some(first) = first else {
                return;
            };

            let mut ws = match Self::connect_with_retries(&config, sample_rate).await {
                Ok(ws) => ws,
                Err(e) => {
                    let _ = event_tx
                        .send(AsrEvent {
                            text: String::new(),
                            is_final: true,
                            error: Some(e.to_string()),
                        })
                        .await;
                    return;
                }
            };
            debug!("ASR stream connected");

            if ws
                .send(WsMessage::Binary(f32_to_s16le(&first).into()))
                .await
                .is_err()
            {
                let _ = event_tx
                    .send(AsrEvent {
                        text: String::new(),
                        is_final: true,
                        error: Some("ASR send failed".into()),
                    })
                    .await;
                return;
            }

            let mut audio_done = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws.send(WsMessage::Text(r#"{"action":"finish"}"#.to_string().into())).await;
                        break;
                    }
                    chunk = pcm_rx.recv(), if !audio_done => {
                        match chunk {
                            Some(pcm) => {
                                if ws.send(WsMessage::Binary(f32_to_s16le(&pcm).into())).await.is_err() {
                                    let _ = event_tx.send(AsrEvent {
                                        text: String::new(),
                                        is_final: true,
                                        error: Some("ASR send failed".into()),
                                    }).await;
                                    break;
                                }
                            }
                            None => {
                                audio_done = true;
                                let _ = ws.send(WsMessage::Text(r#"{"action":"finish"}"#.to_string().into())).await;
                            }
                        }
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(raw))) => {
                                if let Some(event) = parse_result(&raw) {
                                    let is_final = event.is_final;
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                    if is_final && audio_done {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = event_tx.send(AsrEvent {
                                    text: String::new(),
                                    is_final: true,
                                    error: Some(format!("ASR stream error: {}", e)),
                                }).await;
                                break;
                            }
                        }
                    }
                }
            }
            let _ = ws.close(None).await;
        });

        Ok(event_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_partial() {
        let e = parse_result(r#"{"text":"hel","is_final":false}"#).unwrap();
        assert_eq!(e.text, "hel");
        assert!(!e.is_final);
        assert!(e.error.is_none());
    }

    #[test]
    fn test_parse_result_final_with_error() {
        let e = parse_result(r#"{"text":"","is_final":true,"error":"overloaded"}"#).unwrap();
        assert!(e.is_final);
        assert_eq!(e.error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn test_parse_result_garbage_is_none() {
        assert!(parse_result("not json").is_none());
    }

    #[test]
    fn test_f32_to_s16le() {
        let bytes = f32_to_s16le(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -i16::MAX);
    }
}
