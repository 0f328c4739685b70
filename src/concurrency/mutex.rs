//! Asynchronous FIFO mutex with a watchdog escape hatch.
//!
//! Unlike `tokio::sync::Mutex`, this mutex can be force-unlocked from the
//! outside (a wedged holder cannot starve later passes) and reports when it
//! becomes fully drained so per-key registries can garbage-collect it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;

use crate::events::{EventBus, Subscription};

struct State {
    /// Grant token of the current holder, if any. Tokens are unique per
    /// grant so a force-unlocked guard's later release is a no-op.
    holder: Option<u64>,
    next_token: u64,
    waiters: VecDeque<oneshot::Sender<u64>>,
}

struct Inner {
    state: StdMutex<State>,
    freed: EventBus<()>,
}

impl Inner {
    /// Grants the lock to the oldest live waiter, or frees the mutex.
    /// Returns true if the mutex became free.
    fn grant_next(state: &mut State) -> bool {
        while let Some(waiter) = state.waiters.pop_front() {
            let token = state.next_token;
            state.next_token += 1;
            // A waiter that dropped its lock future is skipped.
            if waiter.send(token).is_ok() {
                state.holder = Some(token);
                return false;
            }
        }
        state.holder = None;
        true
    }

    fn release(&self, token: u64) {
        let became_free = {
            let mut state = self.state.lock().unwrap();
            if state.holder != Some(token) {
                // Stale guard: the holder was force-unlocked in the
                // meantime. Releasing twice must not unlock someone else.
                return;
            }
            Self::grant_next(&mut state)
        };
        if became_free {
            self.freed.emit(&());
        }
    }
}

/// Promise-style mutual exclusion with FIFO waiters.
#[derive(Clone)]
pub struct AsyncMutex {
    inner: Arc<Inner>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(State {
                    holder: None,
                    next_token: 0,
                    waiters: VecDeque::new(),
                }),
                freed: EventBus::new(),
            }),
        }
    }

    /// Acquires the mutex, queueing FIFO behind prior callers.
    pub async fn lock(&self) -> MutexGuard {
        let receiver = {
            let mut state = self.inner.state.lock().unwrap();
            if state.holder.is_none() && state.waiters.is_empty() {
                let token = state.next_token;
                state.next_token += 1;
                state.holder = Some(token);
                return MutexGuard {
                    inner: Arc::clone(&self.inner),
                    token,
                    released: false,
                };
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        // A closed channel means the sender was dropped without a grant
        // (mutex teardown); re-queue instead of waiting forever.
        match receiver.await {
            Ok(token) => MutexGuard {
                inner: Arc::clone(&self.inner),
                token,
                released: false,
            },
            Err(_) => Box::pin(self.lock()).await,
        }
    }

    /// Acquires the mutex, runs `f`, and releases on every exit path.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let guard = self.lock().await;
        let out = f().await;
        guard.release();
        out
    }

    /// Evicts the current holder regardless of who acquired the lock.
    ///
    /// Watchdog escape hatch only: the evicted holder's guard becomes
    /// inert, and the next waiter (if any) is granted immediately.
    pub fn force_unlock(&self) {
        let became_free = {
            let mut state = self.inner.state.lock().unwrap();
            if state.holder.is_none() {
                return;
            }
            Inner::grant_next(&mut state)
        };
        if became_free {
            self.inner.freed.emit(&());
        }
    }

    /// True when the mutex is unheld with no waiters.
    pub fn is_free(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.holder.is_none() && state.waiters.is_empty()
    }

    /// Fires exactly when the mutex transitions to unheld-with-no-waiters.
    pub fn on_free(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription<()> {
        self.inner.freed.subscribe(move |_| callback())
    }
}

/// Held lock. Dropping it releases; [`MutexGuard::release`] does so
/// explicitly.
pub struct MutexGuard {
    inner: Arc<Inner>,
    token: u64,
    released: bool,
}

impl MutexGuard {
    pub fn release(mut self) {
        self.released = true;
        self.inner.release(self.token);
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if !self.released {
            self.inner.release(self.token);
        }
    }
}
