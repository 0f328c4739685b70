//! Per-runbook mutex registry.
//!
//! Guarantees at most one synchronizer pass per runbook at a time.
//! Entries are garbage-collected deterministically when their mutex
//! reports `freed` and no acquisition is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use crate::concurrency::{AsyncMutex, MutexGuard};
use crate::events::Subscription;

struct Entry {
    mutex: AsyncMutex,
    /// Acquisitions handed out but not yet released; entries with live
    /// leases are never collected even while the mutex is free.
    leases: usize,
    _freed: Subscription<()>,
}

#[derive(Default)]
struct Inner {
    entries: StdMutex<HashMap<String, Entry>>,
}

/// Registry of per-entity mutexes keyed by runbook id.
#[derive(Clone, Default)]
pub struct MutexRegistry {
    inner: Arc<Inner>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the mutex for `id`, creating it on first use. Back-to-back
    /// acquisitions for the same id serialize FIFO.
    pub async fn acquire(&self, id: &str) -> EntityGuard {
        let mutex = {
            let mut entries = self.inner.entries.lock().unwrap();
            let entry = entries.entry(id.to_string()).or_insert_with(|| {
                let mutex = AsyncMutex::new();
                let freed = {
                    let inner = Arc::downgrade(&self.inner);
                    let id = id.to_string();
                    let mutex = mutex.clone();
                    mutex.clone().on_free(move || {
                        if let Some(inner) = inner.upgrade() {
                            let mut entries = inner.entries.lock().unwrap();
                            let collectable = entries
                                .get(&id)
                                .is_some_and(|entry| entry.leases == 0 && mutex.is_free());
                            if collectable {
                                entries.remove(&id);
                            }
                        }
                    })
                };
                Entry {
                    mutex,
                    leases: 0,
                    _freed: freed,
                }
            });
            entry.leases += 1;
            entry.mutex.clone()
        };

        let guard = mutex.lock().await;
        EntityGuard {
            id: id.to_string(),
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Force-unlocks the mutex for `id`, if one is registered. Watchdog
    /// escape hatch for a wedged pass.
    pub fn force_unlock(&self, id: &str) {
        let mutex = {
            let entries = self.inner.entries.lock().unwrap();
            entries.get(id).map(|entry| entry.mutex.clone())
        };
        if let Some(mutex) = mutex {
            tracing::warn!(runbook_id = %id, "force-unlocking entity mutex");
            mutex.force_unlock();
        }
    }

    /// Number of registered mutexes (free ones are collected).
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().unwrap().is_empty()
    }
}

/// Held per-entity lock. Dropping it releases the mutex and, when nothing
/// else holds or awaits it, lets the registry collect the entry.
pub struct EntityGuard {
    id: String,
    guard: Option<MutexGuard>,
    inner: Arc<Inner>,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        // Release before decrementing the lease so the freed-event GC
        // observes a consistent "no lease, free mutex" state.
        self.guard.take();

        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.id) {
            entry.leases -= 1;
            if entry.leases == 0 && entry.mutex.is_free() {
                entries.remove(&self.id);
            }
        }
    }
}
