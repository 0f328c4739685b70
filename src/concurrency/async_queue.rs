//! Bounded-concurrency resource checkout with priority lanes.
//!
//! Callers check out one of `limit` slots; when all slots are taken, they
//! queue under their priority. Releasing a slot wakes the oldest waiter in
//! the highest non-empty priority bucket, so higher lanes are exhausted
//! before lower ones, and each lane is FIFO.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::oneshot;

/// Misuse of a [`Permit`]. Programmer error; never caught in correct code.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("release of an already-released permit, or no resources checked out")]
    InvalidRelease,
}

struct State {
    limit: usize,
    checked_out: usize,
    buckets: BTreeMap<i32, VecDeque<oneshot::Sender<()>>>,
}

struct Inner {
    state: StdMutex<State>,
}

impl Inner {
    fn release(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.checked_out == 0 {
            return Err(QueueError::InvalidRelease);
        }

        // Hand the slot to the oldest waiter in the highest bucket; a
        // waiter whose checkout future was dropped is skipped.
        loop {
            let top = match state.buckets.iter().next_back() {
                Some((&priority, _)) => priority,
                None => break,
            };
            let waiter = state
                .buckets
                .get_mut(&top)
                .and_then(|bucket| bucket.pop_front());
            if state
                .buckets
                .get(&top)
                .is_some_and(|bucket| bucket.is_empty())
            {
                state.buckets.remove(&top);
            }
            match waiter {
                Some(sender) => {
                    if sender.send(()).is_ok() {
                        // Slot transferred; checked_out is unchanged.
                        return Ok(());
                    }
                }
                None => break,
            }
        }

        state.checked_out -= 1;
        Ok(())
    }
}

/// Bounded pool of abstract resources with prioritized waiting.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<Inner>,
}

impl AsyncQueue {
    /// Creates a queue with `limit` concurrently-checked-out resources.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "AsyncQueue requires a non-zero limit");
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(State {
                    limit,
                    checked_out: 0,
                    buckets: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Checks out a resource, waiting under `priority` if none is free.
    pub async fn checkout(&self, priority: i32) -> Permit {
        let receiver = {
            let mut state = self.inner.state.lock().unwrap();
            if state.checked_out < state.limit {
                state.checked_out += 1;
                return Permit {
                    inner: Arc::clone(&self.inner),
                    released: false,
                };
            }
            let (sender, receiver) = oneshot::channel();
            state.buckets.entry(priority).or_default().push_back(sender);
            receiver
        };

        match receiver.await {
            Ok(()) => Permit {
                inner: Arc::clone(&self.inner),
                released: false,
            },
            // The queue was dropped while we waited; re-queue from scratch.
            Err(_) => Box::pin(self.checkout(priority)).await,
        }
    }

    /// Number of resources currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().unwrap().checked_out
    }

    /// Number of callers waiting across all priority buckets.
    pub fn waiting(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.buckets.values().map(VecDeque::len).sum()
    }
}

/// A checked-out resource. Dropping it releases the slot; releasing twice
/// is a [`QueueError::InvalidRelease`].
pub struct Permit {
    inner: Arc<Inner>,
    released: bool,
}

impl Permit {
    pub fn release(&mut self) -> Result<(), QueueError> {
        if self.released {
            return Err(QueueError::InvalidRelease);
        }
        self.released = true;
        self.inner.release()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            // A permit only exists while its slot is held, so this cannot
            // observe checked_out == 0.
            let _ = self.inner.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_checkout_under_limit_is_immediate() {
        let queue = AsyncQueue::new(2);
        let _a = queue.checkout(0).await;
        let _b = queue.checkout(0).await;
        assert_eq!(queue.checked_out(), 2);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_third_checkout_blocks_until_release() {
        let queue = AsyncQueue::new(2);
        let mut a = queue.checkout(0).await;
        let _b = queue.checkout(0).await;

        let resolved = Arc::new(AtomicUsize::new(0));
        let resolved_clone = Arc::clone(&resolved);
        let queue_clone = queue.clone();
        tokio::spawn(async move {
            let _c = queue_clone.checkout(0).await;
            resolved_clone.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        });
        settle().await;
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
        assert_eq!(queue.waiting(), 1);

        a.release().unwrap();
        settle().await;
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(queue.checked_out(), 2);
    }

    #[tokio::test]
    async fn test_priority_exhausted_before_lower_bucket() {
        let queue = AsyncQueue::new(1);
        let mut held = queue.checkout(0).await;
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Enqueue low, high, high; expect high, high, low.
        for (label, priority) in [("low", 0), ("high-1", 2), ("high-2", 2)] {
            let queue = queue.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let mut permit = queue.checkout(priority).await;
                order.lock().unwrap().push(label);
                permit.release().unwrap();
            });
            settle().await;
        }

        held.release().unwrap();
        settle().await;
        assert_eq!(*order.lock().unwrap(), vec!["high-1", "high-2", "low"]);
    }

    #[tokio::test]
    async fn test_double_release_is_invalid() {
        let queue = AsyncQueue::new(1);
        let mut permit = queue.checkout(0).await;
        permit.release().unwrap();
        assert_eq!(permit.release(), Err(QueueError::InvalidRelease));
        assert_eq!(queue.checked_out(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let queue = AsyncQueue::new(1);
        {
            let _permit = queue.checkout(0).await;
            assert_eq!(queue.checked_out(), 1);
        }
        assert_eq!(queue.checked_out(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let queue = AsyncQueue::new(1);
        let mut held = queue.checkout(0).await;

        let queue_clone = queue.clone();
        let abandoned = tokio::spawn(async move {
            let _permit = queue_clone.checkout(0).await;
        });
        settle().await;
        abandoned.abort();
        settle().await;

        held.release().unwrap();
        assert_eq!(queue.checked_out(), 0);
    }
}
