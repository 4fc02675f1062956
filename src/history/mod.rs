//! Hash-sharded history workers
//!
//! Every `add_message` event is routed by hash of the session identity to a
//! fixed worker shard, so all events of one session are processed in
//! publication order while different sessions proceed in parallel. Each
//! worker performs, in order: short-memory append (insert phase only),
//! long-memory ingestion (insert phase, long mode only), then the HTTP
//! save/update against the history service. Session-end events flush the
//! long-memory provider on the same shard.

pub mod client;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::MemoryMode;
use crate::events::{BusEvent, EventBus, Topic};
use crate::memory::{LongMemory, ShortMemory};
use crate::types::{AddMessageEvent, SessionEndEvent};

pub use client::HistoryService;

/// Where the workers deliver events. Separated from the HTTP client so the
/// sharding machinery is testable without a server.
#[async_trait]
pub trait HistorySink: Send + Sync + 'static {
    async fn handle_message(&self, event: AddMessageEvent) -> Result<()>;
    async fn handle_session_end(&self, event: SessionEndEvent) -> Result<()>;
}

/// Worker count: a power of two sized to the machine, clamped to [4, 64].
pub fn shard_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cpus.next_power_of_two().clamp(4, 64)
}

/// Shard routing: hash the session id, falling back to the device id for
/// events without one.
pub fn shard_for(session_id: &str, device_id: &str, shards: usize) -> usize {
    let key = if session_id.is_empty() { device_id } else { session_id };
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) & (shards - 1)
}

/// Subscribe to the bus and fan events out over `shards` ordered workers.
pub fn spawn_history_workers(bus: &EventBus, sink: Arc<dyn HistorySink>, shards: usize) {
    debug_assert!(shards.is_power_of_two());
    let mut shard_txs: Vec<mpsc::UnboundedSender<BusEvent>> = Vec::with_capacity(shards);
    for shard in 0..shards {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        shard_txs.push(tx);
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match event {
                    BusEvent::AddMessage(ev) => sink.handle_message(ev).await,
                    BusEvent::SessionEnd(ev) => sink.handle_session_end(ev).await,
                    BusEvent::ExitChat(_) => Ok(()),
                };
                if let Err(e) = result {
                    warn!(shard, error = %e, "history worker event failed");
                }
            }
        });
    }

    let mut add_rx = bus.subscribe(Topic::AddMessage);
    let mut end_rx = bus.subscribe(Topic::SessionEnd);
    tokio::spawn(async move {
        loop {
            // Biased: message events drain before a session-end flush.
            let event = tokio::select! {
                biased;
                e = add_rx.recv() => e,
                e = end_rx.recv() => e,
            };
            let Some(event) = event else { break };
            let shard = match &event {
                BusEvent::AddMessage(ev) => shard_for(&ev.session_id, &ev.device_id, shards),
                BusEvent::SessionEnd(ev) => shard_for(&ev.session_id, &ev.device_id, shards),
                BusEvent::ExitChat(_) => continue,
            };
            if shard_txs[shard].send(event).is_err() {
                break;
            }
        }
        debug!("history router stopped");
    });
}

/// Production sink: short memory + long memory + history HTTP.
pub struct HistoryPipeline {
    service: Arc<HistoryService>,
    short_memory: Option<ShortMemory>,
    long_memory: Option<Arc<dyn LongMemory>>,
    memory_mode: MemoryMode,
}

impl HistoryPipeline {
    pub fn new(
        service: Arc<HistoryService>,
        short_memory: Option<ShortMemory>,
        long_memory: Option<Arc<dyn LongMemory>>,
        memory_mode: MemoryMode,
    ) -> Self {
        Self {
            service,
            short_memory,
            long_memory,
            memory_mode,
        }
    }
}

#[async_trait]
impl HistorySink for HistoryPipeline {
    async fn handle_message(&self, event: AddMessageEvent) -> Result<()> {
        if !event.is_update {
            if let Some(short) = &self.short_memory {
                if let Err(e) = short
                    .append(&event.agent_id, &event.device_id, &event.message)
                    .await
                {
                    warn!(error = %e, "short-memory append failed");
                }
            }
            if self.memory_mode == MemoryMode::Long {
                if let Some(long) = &self.long_memory {
                    if let Err(e) = long
                        .add_message(&event.agent_id, &event.device_id, &event.message)
                        .await
                    {
                        warn!(error = %e, "long-memory ingest failed");
                    }
                }
            }
        }

        if !self.service.enabled() {
            return Ok(());
        }
        if event.is_update {
            self.service.update_audio(&event).await
        } else {
            self.service.save_message(&event).await
        }
    }

    async fn handle_session_end(&self, event: SessionEndEvent) -> Result<()> {
        if self.memory_mode == MemoryMode::Long {
            if let Some(long) = &self.long_memory {
                long.flush(&event.agent_id, &event.device_id).await?;
            }
        }
        debug!(session_id = %event.session_id, "session history flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::sync::Mutex;

    struct RecordingSink {
        seen: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl HistorySink for RecordingSink {
        async fn handle_message(&self, event: AddMessageEvent) -> Result<()> {
            // Stagger handling so out-of-order processing would be visible.
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            self.seen.lock().unwrap().push((
                event.session_id.clone(),
                event.message_id.clone(),
                event.is_update,
            ));
            Ok(())
        }

        async fn handle_session_end(&self, _event: SessionEndEvent) -> Result<()> {
            Ok(())
        }
    }

    fn event(session: &str, id: &str, is_update: bool) -> BusEvent {
        BusEvent::AddMessage(AddMessageEvent {
            session_id: session.into(),
            device_id: "dev".into(),
            agent_id: "agent".into(),
            message: Message::user("hello"),
            message_id: id.into(),
            audio: None,
            sample_rate: 16000,
            channels: 1,
            is_update,
        })
    }

    #[test]
    fn test_shard_count_is_power_of_two_in_range() {
        let n = shard_count();
        assert!(n.is_power_of_two());
        assert!((4..=64).contains(&n));
    }

    #[test]
    fn test_shard_routing_stable_and_falls_back_to_device() {
        assert_eq!(shard_for("s1", "d1", 16), shard_for("s1", "d1", 16));
        assert_eq!(shard_for("", "d1", 16), shard_for("", "d1", 16));
    }

    #[tokio::test]
    async fn test_per_session_order_preserved_across_shards() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        spawn_history_workers(&bus, sink.clone(), 16);

        // Sessions A and B interleave m1..m10 each.
        for i in 0..10 {
            bus.publish(event("session-a", &format!("a{}", i), false));
            bus.publish(event("session-b", &format!("b{}", i), false));
        }

        // Let the workers drain.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let seen = sink.seen.lock().unwrap();
        let a_order: Vec<&str> = seen
            .iter()
            .filter(|(s, _, _)| s == "session-a")
            .map(|(_, id, _)| id.as_str())
            .collect();
        let b_order: Vec<&str> = seen
            .iter()
            .filter(|(s, _, _)| s == "session-b")
            .map(|(_, id, _)| id.as_str())
            .collect();
        let expect_a: Vec<String> = (0..10).map(|i| format!("a{}", i)).collect();
        let expect_b: Vec<String> = (0..10).map(|i| format!("b{}", i)).collect();
        assert_eq!(a_order, expect_a.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(b_order, expect_b.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_two_phase_events_same_shard_in_order() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        spawn_history_workers(&bus, sink.clone(), 4);

        bus.publish(event("s", "m1", false));
        bus.publish(event("s", "m1", true));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].2, "insert phase first");
        assert!(seen[1].2, "audio update second");
    }
}
