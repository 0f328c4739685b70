//! Optimistic-update/version-reconciliation engine for one document.
//!
//! The manager owns the authoritative `(value, version)` pair for a single
//! state id. Local edits apply optimistically on top of the confirmed
//! value; server updates either confirm them (by change ref), apply in
//! strict version order, or, on a version gap, trigger a full resync that
//! replays any updates cached while it was in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::events::{EventBus, Subscription};

use super::adapter::{AdapterError, SharedStateAdapter};
use super::delta::{diff, patch};
use super::document::{
    ChangeRef, OptimisticUpdate, ServerUpdate, SharedStateDocument, Version, NEVER_SYNCED,
};

const RESYNC_MAX_ATTEMPTS: usize = 5;
const RESYNC_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Lifecycle of a manager. Replaces the mutable-boolean guards of the old
/// design with one explicit machine, checked before each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Steady,
    Resyncing,
}

struct DocState {
    value: Value,
    version: Version,
    optimistic: Vec<OptimisticUpdate>,
    /// Updates received beyond the expected version while a resync is in
    /// flight, keyed by version for ordered replay.
    cached: BTreeMap<Version, ServerUpdate>,
    phase: Phase,
}

fn overlay(state: &DocState) -> Value {
    let mut visible = state.value.clone();
    for update in &state.optimistic {
        if update.delta.is_empty() {
            continue;
        }
        match patch(&visible, &update.delta) {
            Ok(next) => visible = next,
            Err(err) => {
                tracing::warn!(
                    change_ref = %update.change_ref,
                    "skipping optimistic update that no longer applies: {err}"
                );
            }
        }
    }
    visible
}

/// Replication manager for one shared-state document.
pub struct SharedStateManager<A: SharedStateAdapter> {
    state_id: String,
    adapter: Arc<A>,
    state: StdMutex<DocState>,
    changed: EventBus<Value>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl<A: SharedStateAdapter> SharedStateManager<A> {
    pub fn new(state_id: impl Into<String>, adapter: A) -> Self {
        Self {
            state_id: state_id.into(),
            adapter: Arc::new(adapter),
            state: StdMutex::new(DocState {
                value: Value::Null,
                version: NEVER_SYNCED,
                optimistic: Vec::new(),
                cached: BTreeMap::new(),
                phase: Phase::Uninitialized,
            }),
            changed: EventBus::new(),
            pump: StdMutex::new(None),
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    /// Last server-confirmed version.
    pub fn version(&self) -> Version {
        self.state.lock().unwrap().version
    }

    /// Confirmed value with all optimistic updates replayed on top.
    pub fn data(&self) -> Value {
        overlay(&self.state.lock().unwrap())
    }

    /// Pending optimistic updates not yet confirmed by the server.
    pub fn pending_updates(&self) -> Vec<OptimisticUpdate> {
        self.state.lock().unwrap().optimistic.clone()
    }

    /// Notifies on every visible-data change, synchronously with the
    /// mutation that caused it.
    pub fn subscribe(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Subscription<Value> {
        self.changed.subscribe(callback)
    }

    /// Loads the persisted snapshot, joins the replication channel, starts
    /// consuming server updates, and catches up via an initial resync.
    pub async fn init(self: &Arc<Self>) -> Result<(), AdapterError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Uninitialized {
                return Ok(());
            }
            state.phase = Phase::Initializing;
        }

        match self.adapter.get_document().await {
            Ok(Some(document)) => {
                let mut state = self.state.lock().unwrap();
                state.value = document.value;
                state.version = document.version;
                state.optimistic = document.optimistic_updates;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(state_id = %self.state_id, "failed to load persisted state: {err}");
            }
        }

        if let Err(err) = self.adapter.join().await {
            self.state.lock().unwrap().phase = Phase::Uninitialized;
            return Err(err);
        }

        if let Some(mut updates) = self.adapter.take_updates() {
            let weak: Weak<Self> = Arc::downgrade(self);
            let pump = tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    match weak.upgrade() {
                        Some(manager) => manager.handle_update(update),
                        None => break,
                    }
                }
            });
            *self.pump.lock().unwrap() = Some(pump);
        }

        self.state.lock().unwrap().phase = Phase::Steady;
        self.resync().await;
        Ok(())
    }

    /// Applies a local edit optimistically.
    ///
    /// `mutator` receives the current visible data and edits it in place;
    /// returning `false` cancels the edit. The resulting delta is pushed
    /// fire-and-forget (a failed push stays valid locally and rides the
    /// next resync) and subscribers are notified synchronously. Returns
    /// the change ref, or `None` if cancelled or nothing changed.
    pub fn update_optimistic(
        self: &Arc<Self>,
        mutator: impl FnOnce(&mut Value) -> bool,
    ) -> Option<ChangeRef> {
        let (update, log, visible) = {
            let mut state = self.state.lock().unwrap();
            let base = overlay(&state);
            let mut working = base.clone();
            if !mutator(&mut working) {
                return None;
            }
            let delta = diff(&base, &working);
            if delta.is_empty() {
                return None;
            }
            let update = OptimisticUpdate {
                delta,
                change_ref: ChangeRef::new(),
                source_version: state.version,
            };
            state.optimistic.push(update.clone());
            (update, state.optimistic.clone(), overlay(&state))
        };

        let change_ref = update.change_ref;
        let adapter = Arc::clone(&self.adapter);
        let state_id = self.state_id.clone();
        tokio::spawn(async move {
            if let Err(err) = adapter.push(update).await {
                tracing::warn!(%state_id, %change_ref, "optimistic push failed, will ride next resync: {err}");
            }
            if let Err(err) = adapter.save_optimistic_updates(&log).await {
                tracing::warn!(%state_id, "failed to persist optimistic log: {err}");
            }
        });

        self.changed.emit(&visible);
        Some(change_ref)
    }

    /// Drops pending optimistic updates by change ref without waiting for
    /// server confirmation.
    pub fn expire_optimistic(self: &Arc<Self>, refs: &[ChangeRef]) {
        let (log, visible) = {
            let mut state = self.state.lock().unwrap();
            let before = state.optimistic.len();
            state.optimistic.retain(|u| !refs.contains(&u.change_ref));
            if state.optimistic.len() == before {
                return;
            }
            (state.optimistic.clone(), overlay(&state))
        };
        self.persist_log(log);
        self.changed.emit(&visible);
    }

    /// Reconciles one server update against local state.
    pub fn handle_update(self: &Arc<Self>, payload: ServerUpdate) {
        enum Outcome {
            Stale,
            Applied { log_changed: bool, visible: Value },
            Gap { resync_needed: bool },
            PatchFailed,
        }

        let outcome = {
            let mut state = self.state.lock().unwrap();
            let expected = state.version + 1;
            if payload.version < expected {
                Outcome::Stale
            } else if payload.version == expected {
                // Exactly-once acknowledgment: a given change ref leaves
                // the log at most once, whichever path confirms it.
                let log_changed = match state
                    .optimistic
                    .iter()
                    .position(|u| u.change_ref == payload.change_ref)
                {
                    Some(index) => {
                        state.optimistic.remove(index);
                        true
                    }
                    None => false,
                };

                if payload.delta.is_empty() {
                    state.version = payload.version;
                    Outcome::Applied {
                        log_changed,
                        visible: overlay(&state),
                    }
                } else {
                    match patch(&state.value, &payload.delta) {
                        Ok(next) => {
                            state.value = next;
                            state.version = payload.version;
                            Outcome::Applied {
                                log_changed,
                                visible: overlay(&state),
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                state_id = %self.state_id,
                                version = payload.version,
                                "server delta failed to apply, falling back to resync: {err}"
                            );
                            Outcome::PatchFailed
                        }
                    }
                }
            } else {
                let resync_needed = state.phase != Phase::Resyncing;
                state.cached.insert(payload.version, payload);
                Outcome::Gap { resync_needed }
            }
        };

        match outcome {
            Outcome::Stale => {
                tracing::debug!(state_id = %self.state_id, "discarding stale server update");
            }
            Outcome::Applied { log_changed, visible } => {
                self.persist_document();
                if log_changed {
                    self.persist_log(self.pending_updates());
                }
                self.changed.emit(&visible);
            }
            Outcome::Gap { resync_needed } => {
                if resync_needed {
                    self.spawn_resync();
                }
            }
            Outcome::PatchFailed => {
                self.spawn_resync();
            }
        }
    }

    fn spawn_resync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.resync().await;
        });
    }

    /// Full-state catch-up. At most one resync runs per document; callers
    /// racing into this while one is in flight return immediately and
    /// their updates land in the gap cache instead.
    pub async fn resync(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::Resyncing {
                return;
            }
            state.phase = Phase::Resyncing;
        }

        for attempt in 1..=RESYNC_MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RESYNC_RETRY_DELAY).await;
            }

            if let Err(err) = self.adapter.ensure_connected().await {
                tracing::warn!(state_id = %self.state_id, attempt, "resync reconnect failed: {err}");
                continue;
            }

            let last_known = self.version();
            let response = match self.adapter.resync_request(last_known).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(state_id = %self.state_id, attempt, "resync request failed: {err}");
                    continue;
                }
            };

            let committed = {
                let mut state = self.state.lock().unwrap();

                let mut working_value = response.data.clone();
                let mut working_version = response.version;

                // Replay updates cached beyond the returned version, in
                // ascending order. An empty cache means nothing to replay;
                // a hole in the cached sequence aborts the commit and the
                // whole resync is retried rather than applying a gapped
                // run of deltas.
                let mut replay_ok = true;
                if !state.cached.is_empty() {
                    let max_cached = *state.cached.keys().next_back().unwrap();
                    let mut v = response.version + 1;
                    while v <= max_cached {
                        match state.cached.get(&v) {
                            None => {
                                replay_ok = false;
                                break;
                            }
                            Some(update) => {
                                if !update.delta.is_empty() {
                                    match patch(&working_value, &update.delta) {
                                        Ok(next) => working_value = next,
                                        Err(err) => {
                                            tracing::warn!(
                                                state_id = %self.state_id,
                                                version = v,
                                                "cached update failed to replay: {err}"
                                            );
                                            replay_ok = false;
                                            break;
                                        }
                                    }
                                }
                                working_version = v;
                            }
                        }
                        v += 1;
                    }
                }

                if !replay_ok {
                    None
                } else if working_version <= state.version {
                    // The document advanced past this snapshot while the
                    // request was in flight (in-order updates keep applying
                    // during a resync). The version never moves backwards:
                    // keep the newer local state and take only the
                    // confirmation side effects from the response.
                    tracing::debug!(
                        state_id = %self.state_id,
                        response_version = working_version,
                        local_version = state.version,
                        "resync response overtaken by direct updates, keeping local state"
                    );
                    state
                        .optimistic
                        .retain(|u| !response.change_refs.contains(&u.change_ref));
                    let next = state.version + 1;
                    state.cached = state.cached.split_off(&next);
                    state.phase = Phase::Steady;
                    Some((state.optimistic.clone(), overlay(&state)))
                } else {
                    state
                        .optimistic
                        .retain(|u| !response.change_refs.contains(&u.change_ref));
                    state.cached = state.cached.split_off(&(working_version + 1));
                    state.value = working_value;
                    state.version = working_version;
                    state.phase = Phase::Steady;
                    Some((state.optimistic.clone(), overlay(&state)))
                }
            };

            if let Some((log, visible)) = committed {
                self.persist_document();
                self.persist_log(log);
                self.changed.emit(&visible);
                return;
            }

            tracing::debug!(state_id = %self.state_id, attempt, "resync left a cache gap, retrying");
        }

        tracing::warn!(
            state_id = %self.state_id,
            "resync exhausted {RESYNC_MAX_ATTEMPTS} attempts; keeping previous state"
        );
        self.state.lock().unwrap().phase = Phase::Steady;
    }

    fn persist_document(self: &Arc<Self>) {
        let (value, version) = {
            let state = self.state.lock().unwrap();
            (state.value.clone(), state.version)
        };
        let adapter = Arc::clone(&self.adapter);
        let state_id = self.state_id.clone();
        tokio::spawn(async move {
            if let Err(err) = adapter.save_document(&value, version).await {
                tracing::warn!(%state_id, "failed to persist document: {err}");
            }
        });
    }

    fn persist_log(self: &Arc<Self>, log: Vec<OptimisticUpdate>) {
        let adapter = Arc::clone(&self.adapter);
        let state_id = self.state_id.clone();
        tokio::spawn(async move {
            if let Err(err) = adapter.save_optimistic_updates(&log).await {
                tracing::warn!(%state_id, "failed to persist optimistic log: {err}");
            }
        });
    }

    /// Persisted snapshot of the current state, for callers that save
    /// through their own storage.
    pub fn snapshot(&self) -> SharedStateDocument {
        let state = self.state.lock().unwrap();
        SharedStateDocument {
            value: state.value.clone(),
            version: state.version,
            optimistic_updates: state.optimistic.clone(),
        }
    }

    /// Stops the update pump and drops all subscribers.
    pub fn destroy(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.changed.clear();
        self.adapter.destroy();
    }
}

impl<A: SharedStateAdapter> Drop for SharedStateManager<A> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::{Delta, MemoryAdapter, ResyncResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Notify};

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn update(version: Version, before: &Value, after: &Value) -> ServerUpdate {
        ServerUpdate {
            version,
            delta: diff(before, after),
            change_ref: ChangeRef::new(),
        }
    }

    async fn steady_manager(value: Value, version: Version) -> Arc<SharedStateManager<MemoryAdapter>> {
        let adapter = MemoryAdapter::new();
        adapter.set_server_state(value, version);
        let manager = Arc::new(SharedStateManager::new("workspace-folder:w1", adapter));
        manager.init().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_init_loads_server_state() {
        let manager = steady_manager(json!({"folders": {}}), 0).await;
        assert_eq!(manager.version(), 0);
        assert_eq!(manager.data(), json!({"folders": {}}));
    }

    #[tokio::test]
    async fn test_sequential_updates_converge() {
        let v0 = json!({"count": 0});
        let manager = steady_manager(v0.clone(), 0).await;

        let mut snapshots = vec![v0];
        for i in 1..=5 {
            snapshots.push(json!({"count": i}));
        }
        for version in 1..=5i64 {
            let payload = update(
                version,
                &snapshots[(version - 1) as usize],
                &snapshots[version as usize],
            );
            manager.handle_update(payload);
        }

        assert_eq!(manager.version(), 5);
        assert_eq!(manager.data(), json!({"count": 5}));
    }

    #[tokio::test]
    async fn test_stale_update_discarded() {
        let manager = steady_manager(json!({"count": 3}), 3).await;
        manager.handle_update(update(2, &json!({"count": 1}), &json!({"count": 99})));
        assert_eq!(manager.version(), 3);
        assert_eq!(manager.data(), json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_empty_delta_only_advances_version() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        manager.handle_update(ServerUpdate {
            version: 1,
            delta: Delta::default(),
            change_ref: ChangeRef::new(),
        });
        assert_eq!(manager.version(), 1);
        assert_eq!(manager.data(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_reaching_gap_version() {
        let adapter = MemoryAdapter::new();
        adapter.set_server_state(json!({"count": 5}), 5);
        let manager = Arc::new(SharedStateManager::new("workspace-folder:w1", adapter));
        manager.init().await.unwrap();

        // Server has moved on to 8; deliver v8 directly, skipping 6 and 7.
        let manager_adapter = Arc::clone(&manager.adapter);
        manager_adapter.set_server_state(json!({"count": 8}), 8);
        manager.handle_update(update(8, &json!({"count": 7}), &json!({"count": 8})));
        settle().await;

        assert!(manager.version() >= 8);
        assert_eq!(manager.data(), json!({"count": 8}));
    }

    #[tokio::test]
    async fn test_resync_replays_cached_updates_above_returned_version() {
        let adapter = MemoryAdapter::new();
        adapter.set_server_state(json!({"count": 6}), 6);
        let manager = Arc::new(SharedStateManager::new("workspace-folder:w1", adapter));
        manager.init().await.unwrap();

        // Force the resync path while caching versions 8 and 9; the server
        // snapshot only reaches 7, so 8 and 9 must replay on top of it.
        {
            let mut state = manager.state.lock().unwrap();
            state.phase = Phase::Resyncing;
        }
        manager.handle_update(update(8, &json!({"count": 7}), &json!({"count": 8})));
        manager.handle_update(update(9, &json!({"count": 8}), &json!({"count": 9})));
        {
            let mut state = manager.state.lock().unwrap();
            state.phase = Phase::Steady;
        }

        manager.adapter.set_server_state(json!({"count": 7}), 7);
        manager.resync().await;

        assert_eq!(manager.version(), 9);
        assert_eq!(manager.data(), json!({"count": 9}));
        assert!(manager.state.lock().unwrap().cached.is_empty());
    }

    #[tokio::test]
    async fn test_update_optimistic_returns_ref_and_pushes() {
        let manager = steady_manager(json!({"folders": {}}), 0).await;
        let change_ref = manager
            .update_optimistic(|data| {
                data["folders"]["f1"] = json!({"name": "New folder"});
                true
            })
            .unwrap();
        settle().await;

        assert_eq!(manager.data()["folders"]["f1"]["name"], json!("New folder"));
        // Confirmed value untouched until the server acks.
        assert_eq!(manager.version(), 0);
        let pushed = manager.adapter.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].change_ref, change_ref);
        assert_eq!(pushed[0].source_version, 0);
    }

    #[tokio::test]
    async fn test_update_optimistic_cancel_returns_none() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        let result = manager.update_optimistic(|data| {
            data["a"] = json!(2);
            false
        });
        assert!(result.is_none());
        assert_eq!(manager.data(), json!({"a": 1}));
        assert!(manager.pending_updates().is_empty());
    }

    #[tokio::test]
    async fn test_update_optimistic_no_change_is_noop() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        assert!(manager.update_optimistic(|_| true).is_none());
        assert!(manager.pending_updates().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_keeps_update_pending() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        manager.adapter.fail_pushes(true);
        let change_ref = manager
            .update_optimistic(|data| {
                data["a"] = json!(2);
                true
            })
            .unwrap();
        settle().await;

        assert_eq!(manager.data(), json!({"a": 2}));
        assert_eq!(manager.pending_updates()[0].change_ref, change_ref);
    }

    #[tokio::test]
    async fn test_ack_removes_optimistic_exactly_once_direct_path() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        let change_ref = manager
            .update_optimistic(|data| {
                data["a"] = json!(2);
                true
            })
            .unwrap();
        assert_eq!(manager.pending_updates().len(), 1);

        manager.handle_update(ServerUpdate {
            version: 1,
            delta: diff(&json!({"a": 1}), &json!({"a": 2})),
            change_ref,
        });
        assert!(manager.pending_updates().is_empty());
        assert_eq!(manager.data(), json!({"a": 2}));

        // A later update reusing the ref must not remove anything else.
        let other = manager
            .update_optimistic(|data| {
                data["b"] = json!(true);
                true
            })
            .unwrap();
        manager.handle_update(ServerUpdate {
            version: 2,
            delta: Delta::default(),
            change_ref,
        });
        assert_eq!(manager.pending_updates().len(), 1);
        assert_eq!(manager.pending_updates()[0].change_ref, other);
    }

    #[tokio::test]
    async fn test_ack_via_resync_change_refs() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        let change_ref = manager
            .update_optimistic(|data| {
                data["a"] = json!(2);
                true
            })
            .unwrap();

        manager.adapter.set_server_state(json!({"a": 2}), 1);
        manager.adapter.confirm_refs([change_ref]);
        manager.resync().await;

        assert!(manager.pending_updates().is_empty());
        assert_eq!(manager.version(), 1);
        assert_eq!(manager.data(), json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_subscribers_notified_synchronously() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = Arc::clone(&notified);
        let _sub = manager.subscribe(move |_| {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.update_optimistic(|data| {
            data["a"] = json!(2);
            true
        });
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pump_applies_emitted_updates() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        manager
            .adapter
            .emit(update(1, &json!({"a": 1}), &json!({"a": 2})));
        settle().await;
        assert_eq!(manager.version(), 1);
        assert_eq!(manager.data(), json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_resync_survives_transient_failures() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        manager.adapter.fail_next_resyncs(2);
        manager.adapter.set_server_state(json!({"a": 5}), 5);
        manager.resync().await;
        assert_eq!(manager.version(), 5);
        assert_eq!(manager.data(), json!({"a": 5}));
    }

    #[tokio::test]
    async fn test_resync_overtaken_by_direct_updates_keeps_newer_state() {
        /// Wraps the in-memory adapter so a resync request can be held
        /// in flight until the test releases it.
        struct GatedAdapter {
            inner: MemoryAdapter,
            gate: Notify,
            parked: AtomicBool,
        }

        #[async_trait]
        impl SharedStateAdapter for GatedAdapter {
            async fn join(&self) -> Result<(), AdapterError> {
                self.inner.join().await
            }

            async fn push(&self, update: OptimisticUpdate) -> Result<(), AdapterError> {
                self.inner.push(update).await
            }

            async fn resync_request(
                &self,
                last_known: Version,
            ) -> Result<ResyncResponse, AdapterError> {
                if self.parked.load(Ordering::SeqCst) {
                    self.gate.notified().await;
                }
                self.inner.resync_request(last_known).await
            }

            async fn ensure_connected(&self) -> Result<(), AdapterError> {
                self.inner.ensure_connected().await
            }

            fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<ServerUpdate>> {
                self.inner.take_updates()
            }

            async fn get_document(&self) -> Result<Option<SharedStateDocument>, AdapterError> {
                self.inner.get_document().await
            }

            async fn save_document(
                &self,
                value: &Value,
                version: Version,
            ) -> Result<(), AdapterError> {
                self.inner.save_document(value, version).await
            }

            async fn save_optimistic_updates(
                &self,
                updates: &[OptimisticUpdate],
            ) -> Result<(), AdapterError> {
                self.inner.save_optimistic_updates(updates).await
            }
        }

        let adapter = GatedAdapter {
            inner: MemoryAdapter::new(),
            gate: Notify::new(),
            parked: AtomicBool::new(false),
        };
        adapter.inner.set_server_state(json!({"count": 5}), 5);
        let manager = Arc::new(SharedStateManager::new("workspace-folder:w1", adapter));
        manager.init().await.unwrap();
        assert_eq!(manager.version(), 5);

        // Park a resync whose response will carry the v8 snapshot.
        manager.adapter.inner.set_server_state(json!({"count": 8}), 8);
        manager.adapter.parked.store(true, Ordering::SeqCst);
        let resync = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.resync().await })
        };
        settle().await;

        // In-order updates keep applying while the request is in flight,
        // carrying the document past the parked response.
        for version in 6..=9i64 {
            manager.handle_update(update(
                version,
                &json!({"count": version - 1}),
                &json!({"count": version}),
            ));
        }
        assert_eq!(manager.version(), 9);

        manager.adapter.parked.store(false, Ordering::SeqCst);
        manager.adapter.gate.notify_one();
        resync.await.unwrap();

        // The stale v8 snapshot must not roll the document back.
        assert_eq!(manager.version(), 9);
        assert_eq!(manager.data(), json!({"count": 9}));
    }

    #[tokio::test]
    async fn test_expire_optimistic_drops_pending_edit() {
        let manager = steady_manager(json!({"a": 1}), 0).await;
        let change_ref = manager
            .update_optimistic(|data| {
                data["a"] = json!(2);
                true
            })
            .unwrap();
        manager.expire_optimistic(&[change_ref]);
        assert!(manager.pending_updates().is_empty());
        assert_eq!(manager.data(), json!({"a": 1}));
    }
}
