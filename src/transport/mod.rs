//! Device transport message envelope
//!
//! JSON control messages on the text channel, encoded audio frames on the
//! binary channel. The envelope is the existing device protocol; this
//! module only (de)serializes it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AudioFormat;

/// Audio parameters advertised in `hello` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_duration() -> u32 {
    20
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

impl From<AudioParams> for AudioFormat {
    fn from(p: AudioParams) -> Self {
        AudioFormat {
            sample_rate: p.sample_rate,
            channels: p.channels,
            frame_duration_ms: p.frame_duration,
        }
    }
}

impl From<AudioFormat> for AudioParams {
    fn from(f: AudioFormat) -> Self {
        AudioParams {
            sample_rate: f.sample_rate,
            channels: f.channels,
            frame_duration: f.frame_duration_ms,
        }
    }
}

/// Control messages from the device.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        device_id: String,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        features: Option<Value>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Abort,
    Iot {
        text: String,
    },
    Mcp {
        payload: Value,
    },
    Goodbye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// UDP rendezvous advertised to mqtt_udp devices (data path is external).
#[derive(Debug, Clone, Serialize)]
pub struct UdpEndpoint {
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

/// Control messages to the device.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        session_id: String,
        transport: String,
        audio_params: AudioParams,
        #[serde(skip_serializing_if = "Option::is_none")]
        udp: Option<UdpEndpoint>,
    },
    TtsStart,
    TtsStop,
    SentenceStart {
        text: String,
    },
    SentenceEnd {
        text: String,
    },
    AsrResult {
        text: String,
    },
    Mcp {
        payload: Value,
    },
    Iot {
        payload: Value,
    },
    Error {
        message: String,
    },
    Goodbye,
}

/// What the outbound pump writes to the socket.
#[derive(Debug)]
pub enum Outbound {
    Json(ServerMessage),
    Frame(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let raw = r#"{
            "type": "hello",
            "device_id": "aa:bb:cc",
            "transport": "websocket",
            "features": {"mcp": true},
            "audio_params": {"sample_rate": 16000, "channels": 1, "frame_duration": 20}
        }"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Hello {
                device_id,
                transport,
                audio_params,
                ..
            } => {
                assert_eq!(device_id, "aa:bb:cc");
                assert_eq!(transport.as_deref(), Some("websocket"));
                assert_eq!(audio_params.unwrap().frame_duration, 20);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_listen_variants() {
        let start: ClientMessage =
            serde_json::from_str(r#"{"type":"listen","state":"start","mode":"auto"}"#).unwrap();
        assert!(matches!(
            start,
            ClientMessage::Listen {
                state: ListenState::Start,
                ..
            }
        ));
        let detect: ClientMessage =
            serde_json::from_str(r#"{"type":"listen","state":"detect","text":"hey vox"}"#).unwrap();
        assert!(matches!(
            detect,
            ClientMessage::Listen {
                state: ListenState::Detect,
                text: Some(t),
                ..
            } if t == "hey vox"
        ));
    }

    #[test]
    fn test_serialize_control_frames() {
        let frame = serde_json::to_string(&ServerMessage::SentenceStart {
            text: "Hello there.".into(),
        })
        .unwrap();
        assert!(frame.contains(r#""type":"sentence_start""#));
        let stop = serde_json::to_string(&ServerMessage::TtsStop).unwrap();
        assert_eq!(stop, r#"{"type":"tts_stop"}"#);
    }

    #[test]
    fn test_hello_reply_with_udp() {
        let reply = ServerMessage::Hello {
            session_id: "s".into(),
            transport: "mqtt_udp".into(),
            audio_params: AudioParams::default(),
            udp: Some(UdpEndpoint {
                server: "10.0.0.1".into(),
                port: 8884,
                key: "k".into(),
                nonce: "n".into(),
            }),
        };
        let raw = serde_json::to_string(&reply).unwrap();
        assert!(raw.contains(r#""server":"10.0.0.1""#));
    }

    #[test]
    fn test_abort_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"abort"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Abort));
    }
}
