//! Bounded keyed pools of warm provider instances
//!
//! Provider instances (ASR/LLM/TTS/VAD) are expensive to build, so each kind
//! keeps a registry of per-key pools. A pool is created lazily on first
//! demand and synchronously filled to `max_size`. `acquire` hands out
//! exclusive use of one instance and blocks up to the configured timeout
//! when every instance is out; `release` returns it, `discard` destroys a
//! suspected-corrupted instance and back-fills the pool.
//!
//! Keys: LLM/ASR pools key by provider name; TTS keys by `provider:voice`
//! because voices are mutually incompatible warm state.

pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use registry::PoolRegistry;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out acquiring {kind} instance for key {key}")]
    Timeout { kind: &'static str, key: String },
    #[error("{kind} pool is shut down")]
    Shutdown { kind: &'static str },
    #[error("failed to construct {kind} instance for key {key}: {source}")]
    Factory {
        kind: &'static str,
        key: String,
        source: anyhow::Error,
    },
}

type Factory<T> = dyn Fn(&str) -> anyhow::Result<T> + Send + Sync;

struct KeyPool<T> {
    idle_tx: mpsc::Sender<T>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    /// Outstanding acquisitions, id → acquire time.
    allocated: Mutex<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

/// Wrapper granting exclusive use of one pooled instance until it is
/// released or discarded.
#[derive(Debug)]
pub struct Pooled<T> {
    pub key: String,
    id: u64,
    instance: Option<T>,
}

impl<T> Pooled<T> {
    pub fn get(&self) -> &T {
        self.instance.as_ref().expect("pooled instance already taken")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("pooled instance already taken")
    }
}

pub struct ResourcePool<T: Send + 'static> {
    kind: &'static str,
    max_size: usize,
    acquire_timeout: Duration,
    factory: Box<Factory<T>>,
    pools: Mutex<HashMap<String, Arc<KeyPool<T>>>>,
    shut_down: AtomicBool,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        kind: &'static str,
        max_size: usize,
        acquire_timeout: Duration,
        factory: impl Fn(&str) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            max_size: max_size.max(1),
            acquire_timeout,
            factory: Box::new(factory),
            pools: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn get_or_create(&self, key: &str) -> Result<Arc<KeyPool<T>>, PoolError> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(kp) = pools.get(key) {
            return Ok(kp.clone());
        }

        let (idle_tx, idle_rx) = mpsc::channel(self.max_size);
        for _ in 0..self.max_size {
            let instance = (self.factory)(key).map_err(|source| PoolError::Factory {
                kind: self.kind,
                key: key.to_string(),
                source,
            })?;
            idle_tx
                .try_send(instance)
                .map_err(|_| PoolError::Shutdown { kind: self.kind })?;
        }
        debug!(kind = self.kind, key, size = self.max_size, "pool created");

        let kp = Arc::new(KeyPool {
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            allocated: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        pools.insert(key.to_string(), kp.clone());
        Ok(kp)
    }

    /// Take exclusive use of one warm instance for `key`.
    pub async fn acquire(&self, key: &str) -> Result<Pooled<T>, PoolError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown { kind: self.kind });
        }
        let kp = self.get_or_create(key)?;

        // The timeout covers both waiting for the receiver and for a warm
        // instance, so contended keys still fail within the budget.
        let recv = async {
            let mut rx = kp.idle_rx.lock().await;
            rx.recv().await
        };
        let instance = match tokio::time::timeout(self.acquire_timeout, recv).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return Err(PoolError::Shutdown { kind: self.kind }),
            Err(_) => {
                return Err(PoolError::Timeout {
                    kind: self.kind,
                    key: key.to_string(),
                })
            }
        };

        let id = kp.next_id.fetch_add(1, Ordering::Relaxed);
        kp.allocated.lock().unwrap().insert(id, Instant::now());
        Ok(Pooled {
            key: key.to_string(),
            id,
            instance: Some(instance),
        })
    }

    /// Return an instance to its pool. If the pool no longer has room (shut
    /// down or resized), the instance is dropped.
    pub fn release(&self, mut wrapper: Pooled<T>) {
        let Some(instance) = wrapper.instance.take() else {
            return;
        };
        let kp = {
            let pools = self.pools.lock().unwrap();
            pools.get(&wrapper.key).cloned()
        };
        if let Some(kp) = kp {
            kp.allocated.lock().unwrap().remove(&wrapper.id);
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            if kp.idle_tx.try_send(instance).is_err() {
                warn!(kind = self.kind, key = %wrapper.key, "pool full on release, dropping instance");
            }
        }
    }

    /// Destroy an instance suspected of corruption and back-fill the pool
    /// with a freshly constructed one (best effort).
    pub fn discard(&self, mut wrapper: Pooled<T>) {
        let _ = wrapper.instance.take();
        let kp = {
            let pools = self.pools.lock().unwrap();
            pools.get(&wrapper.key).cloned()
        };
        let Some(kp) = kp else { return };
        kp.allocated.lock().unwrap().remove(&wrapper.id);
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        match (self.factory)(&wrapper.key) {
            Ok(replacement) => {
                if kp.idle_tx.try_send(replacement).is_err() {
                    warn!(kind = self.kind, key = %wrapper.key, "pool full while back-filling");
                }
            }
            Err(e) => {
                warn!(kind = self.kind, key = %wrapper.key, error = %e, "failed to back-fill discarded instance");
            }
        }
    }

    /// Stop handing out instances and drop all warm ones.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let pools: Vec<Arc<KeyPool<T>>> = {
            let mut map = self.pools.lock().unwrap();
            map.drain().map(|(_, kp)| kp).collect()
        };
        for kp in pools {
            let mut rx = kp.idle_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
    }

    /// Number of outstanding acquisitions for a key (diagnostics).
    pub fn allocated(&self, key: &str) -> usize {
        self.pools
            .lock()
            .unwrap()
            .get(key)
            .map(|kp| kp.allocated.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(max: usize) -> (Arc<AtomicUsize>, ResourcePool<usize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        let pool = ResourcePool::new("test", max, Duration::from_millis(50), move |_key| {
            Ok(b.fetch_add(1, Ordering::SeqCst))
        });
        (built, pool)
    }

    #[tokio::test]
    async fn test_lazy_construction_to_max_size() {
        let (built, pool) = counting_pool(3);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        let w = pool.acquire("p").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 3);
        pool.release(w);
    }

    #[tokio::test]
    async fn test_exclusive_use_and_release() {
        let (_, pool) = counting_pool(1);
        let w = pool.acquire("p").await.unwrap();
        assert_eq!(pool.allocated("p"), 1);
        // Second acquire must time out while the only instance is held.
        let err = pool.acquire("p").await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        pool.release(w);
        assert_eq!(pool.allocated("p"), 0);
        let w2 = pool.acquire("p").await.unwrap();
        pool.release(w2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (built, pool) = counting_pool(1);
        let a = pool.acquire("alpha").await.unwrap();
        let b = pool.acquire("beta").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        pool.release(a);
        pool.release(b);
    }

    #[tokio::test]
    async fn test_discard_back_fills() {
        let (built, pool) = counting_pool(1);
        let w = pool.acquire("p").await.unwrap();
        pool.discard(w);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        // The replacement is acquirable.
        let w = pool.acquire("p").await.unwrap();
        pool.release(w);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let (_, pool) = counting_pool(1);
        let w = pool.acquire("p").await.unwrap();
        pool.release(w);
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire("p").await.unwrap_err(),
            PoolError::Shutdown { .. }
        ));
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces() {
        let pool: ResourcePool<usize> =
            ResourcePool::new("test", 1, Duration::from_millis(20), |_key| {
                anyhow::bail!("provider unreachable")
            });
        assert!(matches!(
            pool.acquire("p").await.unwrap_err(),
            PoolError::Factory { .. }
        ));
    }
}
