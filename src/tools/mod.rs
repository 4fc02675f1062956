//! Function-calling tools available to the LLM
//!
//! Tools are resolved by name from a per-session registry assembled from
//! the device's configured service names. Tools act on the session only
//! through the [`Operator`] capability interface, which the controller
//! implements; managers and tools never hold the controller itself.

pub mod resource;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// OpenAI-compatible function definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// Structured action returned instead of plain output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    /// End the conversation gracefully after an optional farewell.
    ExitConversation { farewell: Option<String> },
}

/// What a tool produced.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    /// Plain text handed back to the LLM as the tool result.
    Text(String),
    /// Inline audio: played directly through TTS output, suspending LLM
    /// continuation for this turn.
    InlineAudio { data: Vec<u8>, mime: String },
    /// A link to audio content fetched page-by-page and streamed out.
    ResourceLink { url: String, mime: Option<String> },
    /// Structured conversation-level action.
    Action(ToolAction),
}

/// Session capabilities tools are allowed to use.
///
/// Implemented by the session controller; passing the interface instead of
/// the controller breaks the manager ↔ controller reference cycle.
#[async_trait]
pub trait Operator: Send + Sync {
    fn device_id(&self) -> &str;
    fn session_id(&self) -> &str;

    /// Publish an exit-chat event; the session closes after the current
    /// turn finishes announcing.
    fn request_exit(&self, reason: &str);

    /// Forward an IoT command payload to the device.
    async fn send_iot(&self, payload: Value) -> Result<()>;

    /// Query one of the device's configured knowledge bases.
    async fn search_knowledge(&self, base: &str, query: &str) -> Result<String>;
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn invoke(&self, operator: &dyn Operator, arguments: Value) -> Result<ToolOutput>;
}

/// Name → handler registry for one session.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registry with the built-in tools every session carries.
    pub fn with_builtins(knowledge_bases: Vec<crate::config::KnowledgeBase>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExitConversationTool));
        registry.register(Arc::new(IotCommandTool));
        if !knowledge_bases.is_empty() {
            registry.register(Arc::new(KnowledgeSearchTool { knowledge_bases }));
        }
        registry
    }
}

/// Ends the conversation when the user asks to stop talking.
pub struct ExitConversationTool;

#[async_trait]
impl ToolHandler for ExitConversationTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exit_conversation".to_string(),
            description: "End the current voice conversation. Use when the user says they \
                          are done, wants to stop, or says farewell."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "farewell": {
                        "type": "string",
                        "description": "Short goodbye sentence to speak before closing"
                    }
                }
            }),
        }
    }

    async fn invoke(&self, operator: &dyn Operator, arguments: Value) -> Result<ToolOutput> {
        let farewell = arguments
            .get("farewell")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        operator.request_exit("exit_conversation tool");
        Ok(ToolOutput::Action(ToolAction::ExitConversation { farewell }))
    }
}

/// Passes a structured command through to the device's IoT surface.
pub struct IotCommandTool;

#[async_trait]
impl ToolHandler for IotCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "device_command".to_string(),
            description: "Send a command to the device the user is speaking through, e.g. \
                          volume or light control."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command name" },
                    "params": { "type": "object", "description": "Command parameters" }
                },
                "required": ["command"]
            }),
        }
    }

    async fn invoke(&self, operator: &dyn Operator, arguments: Value) -> Result<ToolOutput> {
        operator.send_iot(arguments.clone()).await?;
        let command = arguments
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("command");
        Ok(ToolOutput::Text(format!("sent {} to device", command)))
    }
}

/// Queries the device's configured knowledge bases.
pub struct KnowledgeSearchTool {
    pub knowledge_bases: Vec<crate::config::KnowledgeBase>,
}

#[async_trait]
impl ToolHandler for KnowledgeSearchTool {
    fn definition(&self) -> ToolDefinition {
        let names: Vec<&str> = self.knowledge_bases.iter().map(|k| k.name.as_str()).collect();
        ToolDefinition {
            name: "search_knowledge".to_string(),
            description: format!(
                "Search a knowledge base for facts before answering. Available bases: {}.",
                names.join(", ")
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "base": { "type": "string", "description": "Knowledge base name" },
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["base", "query"]
            }),
        }
    }

    async fn invoke(&self, operator: &dyn Operator, arguments: Value) -> Result<ToolOutput> {
        let base = arguments
            .get("base")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let answer = operator.search_knowledge(base, query).await?;
        Ok(ToolOutput::Text(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeOperator {
        exits: Mutex<Vec<String>>,
        iot: Mutex<Vec<Value>>,
    }

    impl FakeOperator {
        fn new() -> Self {
            Self {
                exits: Mutex::new(Vec::new()),
                iot: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Operator for FakeOperator {
        fn device_id(&self) -> &str {
            "dev-1"
        }

        fn session_id(&self) -> &str {
            "sess-1"
        }

        fn request_exit(&self, reason: &str) {
            self.exits.lock().unwrap().push(reason.to_string());
        }

        async fn send_iot(&self, payload: Value) -> Result<()> {
            self.iot.lock().unwrap().push(payload);
            Ok(())
        }

        async fn search_knowledge(&self, base: &str, query: &str) -> Result<String> {
            Ok(format!("{}:{}", base, query))
        }
    }

    #[tokio::test]
    async fn test_exit_tool_requests_exit_and_returns_action() {
        let op = FakeOperator::new();
        let out = ExitConversationTool
            .invoke(&op, json!({"farewell": "bye!"}))
            .await
            .unwrap();
        assert!(matches!(
            out,
            ToolOutput::Action(ToolAction::ExitConversation { farewell: Some(f) }) if f == "bye!"
        ));
        assert_eq!(op.exits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_iot_tool_forwards_payload() {
        let op = FakeOperator::new();
        let out = IotCommandTool
            .invoke(&op, json!({"command": "volume", "params": {"level": 3}}))
            .await
            .unwrap();
        assert!(matches!(out, ToolOutput::Text(t) if t.contains("volume")));
        assert_eq!(op.iot.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_registry_resolution() {
        let registry = ToolRegistry::with_builtins(vec![crate::config::KnowledgeBase {
            name: "manuals".into(),
            description: String::new(),
        }]);
        assert!(registry.resolve("exit_conversation").is_some());
        assert!(registry.resolve("device_command").is_some());
        assert!(registry.resolve("search_knowledge").is_some());
        assert!(registry.resolve("nope").is_none());
        assert_eq!(registry.definitions().len(), 3);
    }

    #[test]
    fn test_registry_without_knowledge_bases() {
        let registry = ToolRegistry::with_builtins(Vec::new());
        assert!(registry.resolve("search_knowledge").is_none());
    }
}
