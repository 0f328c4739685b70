//! A batch of runbook sync passes running under a concurrency bound.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::concurrency::AsyncQueue;
use crate::error::SyncError;
use crate::events::{EventBus, Subscription};

use super::synchronizer::{RunbookSynchronizer, SyncContext, SyncOutcome, SynchronizerOptions};

/// Outcome notification for one runbook in the set.
#[derive(Debug, Clone)]
pub enum SyncSetEvent {
    Finished { outcome: SyncOutcome },
    Failed { id: String, error: String },
}

struct ActiveEntry {
    started: Instant,
    synchronizer: Arc<RunbookSynchronizer>,
}

#[derive(Default)]
struct SetState {
    /// Queued but not yet holding a concurrency slot.
    pending: HashSet<String>,
    active: HashMap<String, ActiveEntry>,
    workers: HashMap<String, JoinHandle<()>>,
    stopped: bool,
    force_stopped: bool,
    /// Set when [`SyncSet::wait_done`] observes the batch drained; a
    /// finished set never re-activates. A set that is merely empty for a
    /// moment mid-enumeration is not finished and keeps accepting work.
    finished: bool,
}

type OptionsFn = dyn Fn(&str) -> SynchronizerOptions + Send + Sync;

struct SetInner {
    context: SyncContext,
    queue: AsyncQueue,
    options_for: Box<OptionsFn>,
    state: StdMutex<SetState>,
    events: EventBus<SyncSetEvent>,
    done_tx: watch::Sender<()>,
}

impl SetInner {
    fn notify(&self) {
        self.done_tx.send_replace(());
    }
}

/// Runs one sync pass per added runbook, at most `limit` concurrently.
/// Higher-priority additions jump the line but never preempt a running
/// pass. A runbook already pending or active is not added twice.
#[derive(Clone)]
pub struct SyncSet {
    inner: Arc<SetInner>,
}

impl SyncSet {
    pub fn new(
        context: SyncContext,
        limit: usize,
        options_for: impl Fn(&str) -> SynchronizerOptions + Send + Sync + 'static,
    ) -> Self {
        let (done_tx, _done_rx) = watch::channel(());
        Self {
            inner: Arc::new(SetInner {
                context,
                queue: AsyncQueue::new(limit),
                options_for: Box::new(options_for),
                state: StdMutex::new(SetState::default()),
                events: EventBus::new(),
                done_tx,
            }),
        }
    }

    /// Queues a sync pass for `id`. No-op when the set is stopped or
    /// finished, or the runbook is already pending or active.
    pub fn add_runbook(&self, id: &str, priority: i32) {
        let mut state = self.inner.state.lock().unwrap();
        if state.stopped
            || state.finished
            || state.pending.contains(id)
            || state.active.contains_key(id)
        {
            return;
        }
        state.pending.insert(id.to_string());

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        let worker_id = id.clone();
        let handle = tokio::spawn(async move {
            let permit = inner.queue.checkout(priority).await;

            let synchronizer = {
                let mut state = inner.state.lock().unwrap();
                // Removed or stopped while we waited for a slot.
                if state.stopped || !state.pending.remove(&id) {
                    None
                } else {
                    let synchronizer = Arc::new(RunbookSynchronizer::new(
                        id.clone(),
                        inner.context.clone(),
                        (inner.options_for)(&id),
                    ));
                    state.active.insert(
                        id.clone(),
                        ActiveEntry {
                            started: Instant::now(),
                            synchronizer: Arc::clone(&synchronizer),
                        },
                    );
                    Some(synchronizer)
                }
            };

            if let Some(synchronizer) = synchronizer {
                let result = synchronizer.sync().await;
                {
                    let mut state = inner.state.lock().unwrap();
                    state.active.remove(&id);
                    state.workers.remove(&id);
                }
                match result {
                    Ok(outcome) => {
                        tracing::debug!(runbook_id = %id, action = ?outcome.action, "sync finished");
                        inner.events.emit(&SyncSetEvent::Finished { outcome });
                    }
                    Err(err) => {
                        tracing::warn!(runbook_id = %id, "sync failed: {err}");
                        inner.events.emit(&SyncSetEvent::Failed {
                            id: id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            } else {
                inner.state.lock().unwrap().workers.remove(&id);
            }

            drop(permit);
            inner.notify();
        });

        // Registered before the lock is released, so the worker's own
        // cleanup always observes its entry.
        state.workers.insert(worker_id, handle);
    }

    /// Drops a queued pass and cancels an active one at its next
    /// checkpoint. A pass mid-network-call finishes its current step.
    pub fn remove_runbook(&self, id: &str) {
        let synchronizer = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.remove(id);
            state
                .active
                .get(id)
                .map(|entry| Arc::clone(&entry.synchronizer))
        };
        if let Some(synchronizer) = synchronizer {
            synchronizer.cancel_sync();
        }
        self.inner.notify();
    }

    /// Stops accepting work and clears the pending queue. With `force`,
    /// also aborts in-flight passes and marks the set stopped-with-loss,
    /// which makes [`SyncSet::wait_done`] return [`SyncError::Stopped`].
    pub fn stop(&self, force: bool) {
        let (synchronizers, handles) = {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped = true;
            state.pending.clear();
            if !force {
                (Vec::new(), Vec::new())
            } else {
                state.force_stopped = true;
                let synchronizers: Vec<Arc<RunbookSynchronizer>> = state
                    .active
                    .drain()
                    .map(|(_, entry)| entry.synchronizer)
                    .collect();
                let handles: Vec<JoinHandle<()>> =
                    state.workers.drain().map(|(_, handle)| handle).collect();
                (synchronizers, handles)
            }
        };
        for synchronizer in synchronizers {
            synchronizer.cancel_sync();
            synchronizer.force_unlock_mutex();
        }
        for handle in handles {
            handle.abort();
        }
        self.inner.notify();
    }

    /// Watchdog kill for one wedged pass: cancels it, force-unlocks its
    /// entity mutex, and aborts its task. Returns false when `id` has no
    /// active pass.
    pub fn force_kill(&self, id: &str) -> bool {
        let killed = {
            let mut state = self.inner.state.lock().unwrap();
            let entry = match state.active.remove(id) {
                Some(entry) => entry,
                None => return false,
            };
            let handle = state.workers.remove(id);
            (entry, handle)
        };
        let (entry, handle) = killed;

        let elapsed_secs = entry.started.elapsed().as_secs();
        entry.synchronizer.cancel_sync();
        entry.synchronizer.force_unlock_mutex();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.events.emit(&SyncSetEvent::Failed {
            id: id.to_string(),
            error: SyncError::Stuck {
                runbook_id: id.to_string(),
                elapsed_secs,
            }
            .to_string(),
        });
        self.inner.notify();
        true
    }

    /// Resolves when nothing is pending and nothing is active, and marks
    /// the set finished. After a forced stop it resolves with
    /// [`SyncError::Stopped`] instead, since in-flight work was discarded.
    pub async fn wait_done(&self) -> Result<(), SyncError> {
        let mut done_rx = self.inner.done_tx.subscribe();
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.force_stopped {
                    return Err(SyncError::Stopped);
                }
                if state.pending.is_empty() && state.active.is_empty() {
                    state.finished = true;
                    return Ok(());
                }
            }
            if done_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub fn is_working(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.pending.is_empty() || !state.active.is_empty()
    }

    /// The active pass that has been running the longest, for the
    /// watchdog.
    pub fn longest_running(&self) -> Option<(String, Duration)> {
        let state = self.inner.state.lock().unwrap();
        state
            .active
            .iter()
            .map(|(id, entry)| (id.clone(), entry.started.elapsed()))
            .max_by_key(|(_, elapsed)| *elapsed)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    pub fn on_event(
        &self,
        callback: impl Fn(&SyncSetEvent) + Send + Sync + 'static,
    ) -> Subscription<SyncSetEvent> {
        self.inner.events.subscribe(callback)
    }
}
