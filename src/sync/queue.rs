//! Bounded FIFO queue with cancellable blocking pop
//!
//! Producers never block: `push` fails fast when the queue is full or
//! closed, which is the backpressure contract the pipeline wants for
//! real-time data (drop, don't delay). Consumers block on `pop` until an
//! element arrives, the supplied cancellation token fires, or an optional
//! timeout elapses. `clear` drains atomically without closing, which is the
//! barge-in path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
    #[error("cancelled while waiting")]
    Cancelled,
    #[error("timed out while waiting")]
    Timeout,
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    space: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            space: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn try_push(&self, value: T) -> Result<(), (T, QueueError)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((value, QueueError::Closed));
        }
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return Err((value, QueueError::Full));
        }
        items.push_back(value);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking enqueue.
    pub fn push(&self, value: T) -> Result<(), QueueError> {
        self.try_push(value).map_err(|(_, e)| e)
    }

    /// Enqueue, waiting for space when the queue is full.
    pub async fn push_wait(&self, value: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut value = value;
        loop {
            match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err((v, QueueError::Full)) => {
                    value = v;
                    tokio::select! {
                        _ = self.space.notified() => {}
                        _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                    }
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Block until an element is available or `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if let Some(v) = items.pop_front() {
                    drop(items);
                    self.space.notify_one();
                    return Ok(v);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Like [`pop`](Self::pop) with an upper wait bound.
    pub async fn pop_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<T, QueueError> {
        match tokio::time::timeout(timeout, self.pop(cancel)).await {
            Ok(res) => res,
            Err(_) => Err(QueueError::Timeout),
        }
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<T> {
        let v = self.items.lock().unwrap().pop_front();
        if v.is_some() {
            self.space.notify_one();
        }
        v
    }

    /// Atomically drain all queued elements without closing.
    pub fn clear(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut items = self.items.lock().unwrap();
            items.drain(..).collect()
        };
        self.space.notify_waiters();
        drained
    }

    /// Close the queue. Queued elements stay poppable; pushes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Wake every waiter so it observes the closed flag.
        self.notify.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let q = BoundedQueue::new(4);
        let cancel = CancellationToken::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(&cancel).await.unwrap(), 1);
        assert_eq!(q.pop(&cancel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_push_full() {
        let q = BoundedQueue::new(1);
        q.push(1).unwrap();
        assert_eq!(q.push(2), Err(QueueError::Full));
    }

    #[tokio::test]
    async fn test_pop_cancelled() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let waiter = tokio::spawn(async move {
            let q = q;
            q.pop(&child).await
        });
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        let cancel = CancellationToken::new();
        let res = q.pop_timeout(&cancel, Duration::from_millis(20)).await;
        assert_eq!(res, Err(QueueError::Timeout));
    }

    #[tokio::test]
    async fn test_clear_drains_without_close() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        let drained = q.clear();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
        assert!(!q.is_closed());
        q.push(99).unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_push_but_drains_remaining() {
        let q = BoundedQueue::new(4);
        let cancel = CancellationToken::new();
        q.push(7).unwrap();
        q.close();
        assert_eq!(q.push(8), Err(QueueError::Closed));
        assert_eq!(q.pop(&cancel).await.unwrap(), 7);
        assert_eq!(q.pop(&cancel).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_push_wait_blocks_until_space() {
        let q = std::sync::Arc::new(BoundedQueue::new(1));
        let cancel = CancellationToken::new();
        q.push(1).unwrap();
        let q2 = q.clone();
        let c2 = cancel.clone();
        let pusher = tokio::spawn(async move { q2.push_wait(2, &c2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.pop(&cancel).await.unwrap(), 1);
        pusher.await.unwrap().unwrap();
        assert_eq!(q.pop(&cancel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_push_wait_cancelled_while_full() {
        let q = std::sync::Arc::new(BoundedQueue::new(1));
        q.push(1).unwrap();
        let cancel = CancellationToken::new();
        let q2 = q.clone();
        let c2 = cancel.clone();
        let pusher = tokio::spawn(async move { q2.push_wait(2, &c2).await });
        cancel.cancel();
        assert_eq!(pusher.await.unwrap(), Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let q = std::sync::Arc::new(BoundedQueue::new(2));
        let cancel = CancellationToken::new();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop(&cancel).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(42).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }
}
