//! voxhub: real-time voice-dialog session orchestrator
//!
//! Embedded voice devices connect over WebSocket, stream Opus microphone
//! frames, and get back synthesized speech plus control messages. Per
//! session the server runs a four-stage pipeline (voice-activity detection
//! → streaming ASR → LLM generation with tool calls → TTS) with barge-in
//! via nested cancellation scopes, pooled provider resources, a real-time
//! paced audio sender, and two-phase chat-history persistence sharded by
//! device identity.
//!
//! # Example
//!
//! ```ignore
//! use voxhub::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(std::path::Path::new("voxhub.toml"))?;
//!     voxhub::server::start(config).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod sync;
pub mod pool;
pub mod audio;
pub mod events;
pub mod memory;
pub mod providers;
pub mod tools;
pub mod history;
pub mod session;
pub mod transport;
pub mod server;

// Re-export commonly used types for convenience
pub use config::Config;
pub use events::EventBus;
pub use pool::PoolRegistry;
pub use session::SessionController;
pub use types::{Dialogue, Message, Role};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
