//! Configuration management
//!
//! Process-wide settings loaded from a TOML file plus the per-device
//! configuration snapshot resolved at session start.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub greeting: GreetingConfig,
    #[serde(default)]
    pub voice_identify: VoiceIdentifyConfig,
    #[serde(default)]
    pub config_provider: ConfigProviderConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Fallback device snapshot when no per-device configuration exists.
    #[serde(default)]
    pub device_defaults: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Advertised UDP endpoint for mqtt_udp transports (data path external).
    #[serde(default)]
    pub udp_server: String,
    #[serde(default)]
    pub udp_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8989
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            udp_server: String::new(),
            udp_port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Silence budget before the session closes itself (ms).
    #[serde(default = "default_max_idle_duration_ms")]
    pub max_idle_duration_ms: u64,
    /// Realtime interruption policy: 1 = VAD barge-in, 2 = cancel on ASR
    /// commit, 4 = cancel on first ASR delta.
    #[serde(default = "default_realtime_mode")]
    pub realtime_mode: u8,
    /// Seconds to keep restarting ASR on empty results before giving up.
    #[serde(default = "default_asr_max_idle_secs")]
    pub asr_max_idle_secs: u64,
    /// History messages handed to the LLM.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Phrases that end the conversation when spoken by the user.
    #[serde(default = "default_exit_words")]
    pub exit_words: Vec<String>,
    #[serde(default = "default_farewell")]
    pub farewell: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_idle_duration_ms() -> u64 {
    20000
}

fn default_realtime_mode() -> u8 {
    1
}

fn default_asr_max_idle_secs() -> u64 {
    60
}

fn default_max_history() -> usize {
    10
}

fn default_exit_words() -> Vec<String> {
    vec!["goodbye".to_string(), "bye bye".to_string()]
}

fn default_farewell() -> String {
    "Goodbye, talk to you soon.".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly voice assistant on a small speaker. Answer in short, \
     natural spoken sentences without markdown or lists."
        .to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_idle_duration_ms: default_max_idle_duration_ms(),
            realtime_mode: default_realtime_mode(),
            asr_max_idle_secs: default_asr_max_idle_secs(),
            max_history: default_max_history(),
            exit_words: default_exit_words(),
            farewell: default_farewell(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enable: bool,
    /// Accepted static bearer tokens.
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingConfig {
    #[serde(default = "default_true")]
    pub enable_greeting: bool,
    #[serde(default = "default_greeting_list")]
    pub greeting_list: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_greeting_list() -> Vec<String> {
    vec!["Hello, how can I help you today?".to_string()]
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enable_greeting: default_true(),
            greeting_list: default_greeting_list(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceIdentifyConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_speaker_threshold")]
    pub threshold: f32,
    /// Bounded wait for the identification result at ASR commit (ms).
    #[serde(default = "default_speaker_wait_ms")]
    pub wait_ms: u64,
}

fn default_speaker_threshold() -> f32 {
    0.6
}

fn default_speaker_wait_ms() -> u64 {
    300
}

impl Default for VoiceIdentifyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            base_url: String::new(),
            threshold: default_speaker_threshold(),
            wait_ms: default_speaker_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigProviderConfig {
    /// "manager" resolves snapshots over HTTP, "redis" reads a JSON key.
    #[serde(default = "default_config_provider_type")]
    pub r#type: String,
    #[serde(default)]
    pub manager_base_url: String,
    #[serde(default)]
    pub redis_url: String,
}

fn default_config_provider_type() -> String {
    "manager".to_string()
}

impl Default for ConfigProviderConfig {
    fn default() -> Self {
        Self {
            r#type: default_config_provider_type(),
            manager_base_url: String::new(),
            redis_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_history_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_history_retries")]
    pub max_retries: u32,
}

fn default_history_timeout_secs() -> u64 {
    5
}

fn default_history_retries() -> u32 {
    3
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_history_timeout_secs(),
            max_retries: default_history_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "none", "short" or "long".
    #[serde(default = "default_memory_mode")]
    pub mode: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_short_memory_len")]
    pub short_memory_len: usize,
}

fn default_memory_mode() -> String {
    "short".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_short_memory_len() -> usize {
    50
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: default_memory_mode(),
            redis_url: default_redis_url(),
            short_memory_len: default_short_memory_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub vad_size: usize,
    #[serde(default = "default_pool_size")]
    pub asr_size: usize,
    #[serde(default = "default_pool_size")]
    pub llm_size: usize,
    #[serde(default = "default_pool_size")]
    pub tts_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            vad_size: default_pool_size(),
            asr_size: default_pool_size(),
            llm_size: default_pool_size(),
            tts_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Connection settings for the external providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub vad: VadProviderConfig,
    #[serde(default)]
    pub asr: AsrProviderConfig,
    #[serde(default)]
    pub llm: LlmProviderConfig,
    #[serde(default)]
    pub tts: TtsProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadProviderConfig {
    #[serde(default = "default_vad_name")]
    pub name: String,
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    /// Minimum analysis window handed to the detector (ms).
    #[serde(default = "default_vad_window_ms")]
    pub min_window_ms: u32,
}

fn default_vad_name() -> String {
    "energy".to_string()
}

fn default_vad_threshold() -> f32 {
    0.015
}

fn default_vad_window_ms() -> u32 {
    60
}

impl Default for VadProviderConfig {
    fn default() -> Self {
        Self {
            name: default_vad_name(),
            threshold: default_vad_threshold(),
            min_window_ms: default_vad_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrProviderConfig {
    #[serde(default = "default_asr_name")]
    pub name: String,
    /// Streaming recognizer WebSocket endpoint.
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_asr_connect_retries")]
    pub connect_retries: u32,
}

fn default_asr_name() -> String {
    "ws".to_string()
}

fn default_asr_connect_retries() -> u32 {
    2
}

impl Default for AsrProviderConfig {
    fn default() -> Self {
        Self {
            name: default_asr_name(),
            ws_url: String::new(),
            api_key: String::new(),
            connect_retries: default_asr_connect_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_llm_name")]
    pub name: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_name() -> String {
    "openai".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    1024
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            name: default_llm_name(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    #[serde(default = "default_tts_name")]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    /// Wire format the provider returns: "mp3", "pcm" or "wav".
    #[serde(default = "default_tts_format")]
    pub format: String,
}

fn default_tts_name() -> String {
    "http".to_string()
}

fn default_tts_voice() -> String {
    "default".to_string()
}

fn default_tts_format() -> String {
    "mp3".to_string()
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            name: default_tts_name(),
            base_url: String::new(),
            api_key: String::new(),
            voice: default_tts_voice(),
            format: default_tts_format(),
        }
    }
}

/// Per-speaker overrides attached to a recognized voice-print.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerProfile {
    /// Extra system-prompt description for this speaker.
    #[serde(default)]
    pub prompt: String,
    /// Voice the assistant answers with when this speaker talks.
    #[serde(default)]
    pub tts_voice: Option<String>,
}

/// Per-device configuration snapshot taken at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_asr_name")]
    pub asr: String,
    #[serde(default = "default_llm_name")]
    pub llm: String,
    #[serde(default = "default_tts_name")]
    pub tts: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_vad_name")]
    pub vad: String,
    #[serde(default = "default_memory_mode")]
    pub memory_mode: String,
    #[serde(default)]
    pub voice_identify: HashMap<String, SpeakerProfile>,
    #[serde(default)]
    pub mcp_service_names: Vec<String>,
    /// Knowledge bases and when the LLM should consult them.
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBase>,
}

fn default_agent_id() -> String {
    "default".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            asr: default_asr_name(),
            llm: default_llm_name(),
            tts: default_tts_name(),
            tts_voice: default_tts_voice(),
            vad: default_vad_name(),
            memory_mode: default_memory_mode(),
            voice_identify: HashMap::new(),
            mcp_service_names: Vec::new(),
            knowledge_bases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn memory_mode(&self) -> MemoryMode {
        MemoryMode::parse(&self.memory.mode)
    }
}

/// How much chat memory the pipeline carries outside the dialogue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    None,
    Short,
    Long,
}

impl MemoryMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "long" => MemoryMode::Long,
            "none" => MemoryMode::None,
            _ => MemoryMode::Short,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.chat.max_idle_duration_ms, 20000);
        assert_eq!(c.chat.realtime_mode, 1);
        assert_eq!(c.chat.asr_max_idle_secs, 60);
        assert_eq!(c.providers.vad.min_window_ms, 60);
        assert!(c.greeting.enable_greeting);
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            [chat]
            realtime_mode = 4
            exit_words = ["see you"]

            [providers.tts]
            format = "pcm"
            voice = "warm"
        "#;
        let c: Config = toml::from_str(toml).unwrap();
        assert_eq!(c.chat.realtime_mode, 4);
        assert_eq!(c.chat.exit_words, vec!["see you"]);
        assert_eq!(c.providers.tts.format, "pcm");
        // Untouched sections keep their defaults.
        assert_eq!(c.chat.max_idle_duration_ms, 20000);
        assert_eq!(c.history.max_retries, 3);
    }

    #[test]
    fn test_memory_mode_parse() {
        assert_eq!(MemoryMode::parse("long"), MemoryMode::Long);
        assert_eq!(MemoryMode::parse("none"), MemoryMode::None);
        assert_eq!(MemoryMode::parse("short"), MemoryMode::Short);
        assert_eq!(MemoryMode::parse("anything"), MemoryMode::Short);
    }

    #[test]
    fn test_device_config_default_snapshot() {
        let d = DeviceConfig::default();
        assert_eq!(d.tts_voice, "default");
        assert!(d.voice_identify.is_empty());
    }
}
