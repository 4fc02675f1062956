//! HTTP streaming speech synthesis
//!
//! Posts one sentence at a time and converts whatever the provider returns
//! (MP3, raw s16le PCM, or WAV) into Opus frames at the session's output
//! format. PCM streams re-encode incrementally; container formats decode
//! once the body is complete.

use anyhow::Result;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::TtsProvider;
use crate::audio::stream::{decode_pcm_s16le, mp3_to_opus_frames, OpusReencoder};
use crate::audio::wav::wav_to_pcm_f32;
use crate::config::TtsProviderConfig;
use crate::types::AudioFormat;

pub struct HttpTts {
    client: Client,
    config: TtsProviderConfig,
    voice: String,
}

impl HttpTts {
    pub fn new(config: TtsProviderConfig, voice: String) -> Self {
        Self {
            client: Client::new(),
            config,
            voice,
        }
    }
}

async fn send_frames(tx: &mpsc::Sender<Vec<u8>>, frames: Vec<Vec<u8>>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

impl TtsProvider for HttpTts {
    fn text_to_speech_stream(
        &mut self,
        cancel: CancellationToken,
        text: &str,
        format: AudioFormat,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let config = self.config.clone();
        let voice = self.voice.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            let request = json!({
                "text": text,
                "voice": voice,
                "format": config.format,
                "sample_rate": format.sample_rate,
            });
            let send = client
                .post(format!("{}/synthesize", config.base_url))
                .header("Authorization", format!("Bearer {}", config.api_key))
                .json(&request)
                .send();
            let response = tokio::select! {
                r = send => r,
                _ = cancel.cancelled() => return,
            };
            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    warn!(status = %r.status(), "TTS synthesis request rejected");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "TTS synthesis request failed");
                    return;
                }
            };

            let mut body_stream = response.bytes_stream();

            match config.format.as_str() {
                // Raw PCM re-encodes as it streams in.
                "pcm" => {
                    let mut reencoder = match OpusReencoder::new(format) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "failed to create Opus re-encoder");
                            return;
                        }
                    };
                    let mut carry: Vec<u8> = Vec::new();
                    loop {
                        let chunk = tokio::select! {
                            c = body_stream.next() => c,
                            _ = cancel.cancelled() => return,
                        };
                        let Some(chunk) = chunk else { break };
                        let Ok(chunk) = chunk else { return };
                        carry.extend_from_slice(&chunk);
                        // Keep sample alignment across chunk boundaries.
                        let usable = carry.len() - (carry.len() % 2);
                        let pcm = decode_pcm_s16le(&carry[..usable]);
                        carry.drain(..usable);
                        match reencoder.push_pcm(&pcm, format.sample_rate) {
                            Ok(frames) => {
                                if !send_frames(&tx, frames).await {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "PCM re-encode failed");
                                return;
                            }
                        }
                    }
                    if let Ok(frames) = reencoder.finish() {
                        send_frames(&tx, frames).await;
                    }
                }
                // Container formats buffer the body, then decode once.
                other => {
                    let mut body = Vec::new();
                    loop {
                        let chunk = tokio::select! {
                            c = body_stream.next() => c,
                            _ = cancel.cancelled() => return,
                        };
                        let Some(chunk) = chunk else { break };
                        let Ok(chunk) = chunk else { return };
                        body.extend_from_slice(&chunk);
                    }
                    let frames = match other {
                        "wav" => wav_to_pcm_f32(&body).and_then(|(pcm, rate, channels)| {
                            let mono = crate::audio::downmix_to_mono(&pcm, channels);
                            let mut reencoder = OpusReencoder::new(format)?;
                            let mut frames = reencoder.push_pcm(&mono, rate)?;
                            frames.extend(reencoder.finish()?);
                            Ok(frames)
                        }),
                        _ => mp3_to_opus_frames(&body, format),
                    };
                    match frames {
                        Ok(frames) => {
                            send_frames(&tx, frames).await;
                        }
                        Err(e) => warn!(error = %e, "TTS transcode failed"),
                    }
                }
            }
        });

        Ok(rx)
    }

    fn set_voice(&mut self, voice: &str) {
        self.voice = voice.to_string();
    }
}
