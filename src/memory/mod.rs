//! Chat memory outside the in-process dialogue
//!
//! Two layers, both optional per device config:
//! - **short memory**: a capped Redis list per agent+device, appended by the
//!   history workers on phase-1 events and readable for quick context.
//! - **long memory**: a provider that ingests messages and serves a
//!   condensed context string for prompt assembly; flushed at session end.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::types::{Message, Role};

fn memory_key(agent_id: &str, device_id: &str) -> String {
    format!("voxhub:memory:{}:{}", agent_id, device_id)
}

/// Capped per-device recent-message list in Redis.
#[derive(Clone)]
pub struct ShortMemory {
    conn: ConnectionManager,
    max_len: usize,
}

impl ShortMemory {
    pub async fn connect(redis_url: &str, max_len: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn, max_len })
    }

    /// Append one message and trim the list to its cap.
    pub async fn append(&self, agent_id: &str, device_id: &str, message: &Message) -> Result<()> {
        let key = memory_key(agent_id, device_id);
        let line = serde_json::json!({
            "role": message.role.as_str(),
            "content": message.content,
            "time_ms": message.time_ms,
        })
        .to_string();
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&key, line).await.context("Redis RPUSH failed")?;
        let start = -(self.max_len as isize);
        let _: () = conn
            .ltrim(&key, start, -1)
            .await
            .context("Redis LTRIM failed")?;
        Ok(())
    }

    /// Most recent `n` remembered lines, oldest first.
    pub async fn recent(&self, agent_id: &str, device_id: &str, n: usize) -> Result<Vec<String>> {
        let key = memory_key(agent_id, device_id);
        let mut conn = self.conn.clone();
        let lines: Vec<String> = conn
            .lrange(&key, -(n as isize), -1)
            .await
            .context("Redis LRANGE failed")?;
        Ok(lines)
    }
}

/// Long-term memory provider interface.
///
/// The default implementation buffers per device and condenses on flush;
/// real deployments plug a summarizing backend in behind the same trait.
#[async_trait]
pub trait LongMemory: Send + Sync {
    /// Ingest one committed message.
    async fn add_message(&self, agent_id: &str, device_id: &str, message: &Message) -> Result<()>;

    /// Condensed context string for prompt assembly, if any exists.
    async fn context(&self, agent_id: &str, device_id: &str) -> Result<Option<String>>;

    /// Persist whatever is buffered; called when a session ends.
    async fn flush(&self, agent_id: &str, device_id: &str) -> Result<()>;
}

/// Redis-backed long memory: keeps a rolling digest of user/assistant turns
/// in a hash field per device.
pub struct RedisLongMemory {
    conn: ConnectionManager,
    buffered: tokio::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
}

impl RedisLongMemory {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self {
            conn,
            buffered: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn digest_key(agent_id: &str, device_id: &str) -> String {
        format!("voxhub:longmem:{}:{}", agent_id, device_id)
    }
}

#[async_trait]
impl LongMemory for RedisLongMemory {
    async fn add_message(&self, agent_id: &str, device_id: &str, message: &Message) -> Result<()> {
        // Tool chatter does not belong in long-term memory.
        if !matches!(message.role, Role::User | Role::Assistant) || message.content.is_empty() {
            return Ok(());
        }
        let key = Self::digest_key(agent_id, device_id);
        let mut buffered = self.buffered.lock().await;
        buffered
            .entry(key)
            .or_default()
            .push(format!("{}: {}", message.role.as_str(), message.content));
        Ok(())
    }

    async fn context(&self, agent_id: &str, device_id: &str) -> Result<Option<String>> {
        let key = Self::digest_key(agent_id, device_id);
        let mut conn = self.conn.clone();
        let digest: Option<String> = conn.get(&key).await.context("Redis GET failed")?;
        Ok(digest.filter(|d| !d.is_empty()))
    }

    async fn flush(&self, agent_id: &str, device_id: &str) -> Result<()> {
        let key = Self::digest_key(agent_id, device_id);
        let lines = {
            let mut buffered = self.buffered.lock().await;
            buffered.remove(&key).unwrap_or_default()
        };
        if lines.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(&key).await.context("Redis GET failed")?;
        let mut digest = existing.unwrap_or_default();
        if !digest.is_empty() {
            digest.push('\n');
        }
        digest.push_str(&lines.join("\n"));
        // Keep the digest bounded; oldest lines age out first.
        let trimmed: Vec<&str> = digest.lines().rev().take(200).collect();
        let digest: String = trimmed.into_iter().rev().collect::<Vec<_>>().join("\n");
        let _: () = conn.set(&key, digest).await.context("Redis SET failed")?;
        debug!(agent_id, device_id, lines = lines.len(), "flushed long memory");
        Ok(())
    }
}
