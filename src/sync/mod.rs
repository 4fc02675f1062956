//! Session concurrency primitives: bounded queues and nested cancellation.

pub mod queue;
pub mod scope;

pub use queue::{BoundedQueue, QueueError};
pub use scope::Scope;
