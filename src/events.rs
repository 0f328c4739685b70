//! Typed publish/subscribe used by the managers.
//!
//! Subscribers register a callback and receive events synchronously on
//! `emit`. Dropping the returned [`Subscription`] unsubscribes; there is no
//! inheritance-style emitter surface to leak through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    next_id: u64,
    subscribers: HashMap<u64, Callback<E>>,
}

/// A synchronous, typed event bus.
pub struct EventBus<E> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Registers a callback. It stays active until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription<E> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Arc::new(callback));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every current subscriber, synchronously and in
    /// no particular order.
    pub fn emit(&self, event: &E) {
        // Snapshot the callbacks so a subscriber may (un)subscribe from
        // within its own callback without deadlocking.
        let callbacks: Vec<Callback<E>> = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.values().cloned().collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Drops all subscribers at once. Used on teardown.
    pub fn clear(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle to an active subscription; dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    bus: Weak<Mutex<BusInner<E>>>,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().unwrap().subscribers.remove(&self.id);
        }
    }
}
