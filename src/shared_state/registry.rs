//! Reference-counted registry of per-state-id managers.
//!
//! Managers are created lazily on first acquisition and torn down
//! deterministically when the last handle drops, with no reliance on
//! garbage collector timing or weak references.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};

use super::adapter::SharedStateAdapter;
use super::manager::SharedStateManager;

struct Entry<A: SharedStateAdapter> {
    manager: Arc<SharedStateManager<A>>,
    refcount: usize,
}

struct RegistryInner<A: SharedStateAdapter> {
    entries: StdMutex<HashMap<String, Entry<A>>>,
    factory: Box<dyn Fn(&str) -> A + Send + Sync>,
}

/// Hands out ref-counted handles to per-document managers.
pub struct SharedStateRegistry<A: SharedStateAdapter> {
    inner: Arc<RegistryInner<A>>,
}

impl<A: SharedStateAdapter> Clone for SharedStateRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: SharedStateAdapter> SharedStateRegistry<A> {
    /// `factory` builds the adapter for a state id the first time it is
    /// acquired.
    pub fn new(factory: impl Fn(&str) -> A + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: StdMutex::new(HashMap::new()),
                factory: Box::new(factory),
            }),
        }
    }

    /// Acquires a handle to the manager for `state_id`, creating and
    /// initializing it on first acquisition.
    pub async fn acquire(&self, state_id: &str) -> SharedStateHandle<A> {
        let (manager, created) = {
            let mut entries = self.inner.entries.lock().unwrap();
            match entries.get_mut(state_id) {
                Some(entry) => {
                    entry.refcount += 1;
                    (Arc::clone(&entry.manager), false)
                }
                None => {
                    let adapter = (self.inner.factory)(state_id);
                    let manager = Arc::new(SharedStateManager::new(state_id, adapter));
                    entries.insert(
                        state_id.to_string(),
                        Entry {
                            manager: Arc::clone(&manager),
                            refcount: 1,
                        },
                    );
                    (manager, true)
                }
            }
        };

        if created {
            if let Err(err) = manager.init().await {
                // The manager stays usable for optimistic edits; the next
                // resync picks up where init failed.
                tracing::warn!(%state_id, "shared state init failed: {err}");
            }
        }

        SharedStateHandle {
            state_id: state_id.to_string(),
            manager,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Number of live managers.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().unwrap().is_empty()
    }
}

/// Ref-counted access to one manager. Dropping the last handle for a state
/// id tears the manager down.
pub struct SharedStateHandle<A: SharedStateAdapter> {
    state_id: String,
    manager: Arc<SharedStateManager<A>>,
    registry: Arc<RegistryInner<A>>,
}

impl<A: SharedStateAdapter> Deref for SharedStateHandle<A> {
    type Target = Arc<SharedStateManager<A>>;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

impl<A: SharedStateAdapter> Drop for SharedStateHandle<A> {
    fn drop(&mut self) {
        let teardown = {
            let mut entries = self.registry.entries.lock().unwrap();
            match entries.get_mut(&self.state_id) {
                Some(entry) => {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        entries.remove(&self.state_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if teardown {
            self.manager.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::MemoryAdapter;
    use serde_json::json;

    fn registry() -> SharedStateRegistry<MemoryAdapter> {
        SharedStateRegistry::new(|_| {
            let adapter = MemoryAdapter::new();
            adapter.set_server_state(json!({"folders": {}}), 0);
            adapter
        })
    }

    #[tokio::test]
    async fn test_same_id_shares_one_manager() {
        let registry = registry();
        let a = registry.acquire("workspace-folder:w1").await;
        let b = registry.acquire("workspace-folder:w1").await;
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&*a, &*b));
    }

    #[tokio::test]
    async fn test_distinct_ids_get_distinct_managers() {
        let registry = registry();
        let _a = registry.acquire("workspace-folder:w1").await;
        let _b = registry.acquire("workspace-folder:w2").await;
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_last_drop_tears_down() {
        let registry = registry();
        let a = registry.acquire("workspace-folder:w1").await;
        let b = registry.acquire("workspace-folder:w1").await;

        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());

        // Re-acquiring builds a fresh manager.
        let c = registry.acquire("workspace-folder:w1").await;
        assert_eq!(c.version(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_derefs_to_manager() {
        let registry = registry();
        let handle = registry.acquire("workspace-folder:w1").await;
        assert_eq!(handle.state_id(), "workspace-folder:w1");
        assert_eq!(handle.data(), json!({"folders": {}}));
    }
}
