//! Streaming chat-completion client (OpenAI-compatible wire format)
//!
//! Streams SSE deltas, forwarding text chunks and tool-call fragments as
//! they arrive. Provider quirks are tolerated at the parse layer: content
//! may be a string or an array of parts, tool-call arguments may be a
//! string or a raw object.

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{LlmDelta, LlmProvider, ToolCallDelta};
use crate::config::LlmProviderConfig;
use crate::tools::ToolDefinition;
use crate::types::{Message, Role};

pub struct OpenAiLlm {
    client: Client,
    config: LlmProviderConfig,
}

impl OpenAiLlm {
    pub fn new(config: LlmProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

/// Map dialogue messages onto the chat-completions wire shape.
pub(crate) fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = json!({
                "role": m.role.as_str(),
                "content": m.content,
            });
            if m.role == Role::Assistant {
                if let Some(calls) = &m.tool_calls {
                    obj["tool_calls"] = Value::Array(
                        calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": { "name": c.name, "arguments": c.arguments },
                                })
                            })
                            .collect(),
                    );
                }
            }
            if m.role == Role::Tool {
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = Value::String(id.clone());
                }
            }
            obj
        })
        .collect()
}

/// Extract text from a delta `content` that may be a string or an array of
/// content parts.
fn content_as_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| {
                    if p.get("type").and_then(|t| t.as_str()) == Some("text") {
                        p.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

/// Parse one SSE `data:` payload into a delta. Returns None for frames
/// with nothing the pipeline cares about.
pub(crate) fn parse_sse_data(data: &str) -> Option<LlmDelta> {
    let raw: Value = serde_json::from_str(data).ok()?;
    let delta = raw.get("choices")?.as_array()?.first()?.get("delta")?;

    let mut out = LlmDelta::default();
    if let Some(content) = delta.get("content") {
        out.content = content_as_text(content);
    }
    if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            let arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            out.tool_calls.push(ToolCallDelta {
                index,
                id,
                name,
                arguments,
            });
        }
    }
    if out.content.is_none() && out.tool_calls.is_empty() {
        return None;
    }
    Some(out)
}

impl LlmProvider for OpenAiLlm {
    fn response_with_context(
        &mut self,
        cancel: CancellationToken,
        session_id: &str,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<LlmDelta> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let config = self.config.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut request = json!({
                "model": config.model,
                "messages": wire_messages(&messages),
                "max_tokens": config.max_tokens,
                "stream": true,
                "user": session_id,
            });
            if !tools.is_empty() {
                request["tools"] = Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                },
                            })
                        })
                        .collect(),
                );
                request["tool_choice"] = Value::String("auto".to_string());
            }

            let send = client
                .post(format!("{}/chat/completions", config.base_url))
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
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    let _ = tx
                        .send(LlmDelta {
                            error: Some(format!("LLM API error ({}): {}", status, body)),
                            ..Default::default()
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(LlmDelta {
                            error: Some(format!("LLM request failed: {}", e)),
                            ..Default::default()
                        })
                        .await;
                    return;
                }
            };

            use futures_util::StreamExt;
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let chunk = tokio::select! {
                    c = stream.next() => c,
                    _ = cancel.cancelled() => {
                        debug!("LLM stream cancelled mid-flight");
                        return;
                    }
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(LlmDelta {
                                error: Some(format!("LLM stream read failed: {}", e)),
                                ..Default::default()
                            })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines.
                while let Some(pos) = buffer.find("\n\n") {
                    let event: String = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        if let Some(delta) = parse_sse_data(data) {
                            if tx.send(delta).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            if !buffer.trim().is_empty() {
                warn!("LLM stream ended with unparsed trailing data");
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn test_parse_content_delta() {
        let d = parse_sse_data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(d.content.as_deref(), Some("Hel"));
        assert!(d.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_delta_fragments() {
        let first = parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lights","arguments":""}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(first.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(first.tool_calls[0].name.as_deref(), Some("lights"));

        let follow = parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"on\":true}"}}]}}]}"#,
        )
        .unwrap();
        assert!(follow.tool_calls[0].id.is_none());
        assert_eq!(follow.tool_calls[0].arguments, r#"{"on":true}"#);
    }

    #[test]
    fn test_parse_object_arguments_normalized() {
        let d = parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":{"on":true}}}]}}]}"#,
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&d.tool_calls[0].arguments).unwrap();
        assert_eq!(parsed["on"], Value::Bool(true));
    }

    #[test]
    fn test_parse_empty_delta_is_none() {
        assert!(parse_sse_data(r#"{"choices":[{"delta":{}}]}"#).is_none());
        assert!(parse_sse_data("garbage").is_none());
    }

    #[test]
    fn test_wire_messages_tool_alignment_shape() {
        let messages = vec![
            Message::user("turn on the lights"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "lights".into(),
                    arguments: "{}".into(),
                }],
            ),
            Message::tool_result("call_1", "ok"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_content_parts_array() {
        let d = parse_sse_data(
            r#"{"choices":[{"delta":{"content":[{"type":"text","text":"Hi "},{"type":"text","text":"there"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(d.content.as_deref(), Some("Hi there"));
    }
}
