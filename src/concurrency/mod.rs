//! Cooperative concurrency primitives for the sync engine.
//!
//! Both primitives hand out permits asynchronously and never block a
//! thread: callers queue as futures and are woken in a deterministic
//! order (FIFO for the mutex, priority-then-FIFO for the queue).

mod async_queue;
mod mutex;

pub use async_queue::{AsyncQueue, Permit, QueueError};
pub use mutex::{AsyncMutex, MutexGuard};
