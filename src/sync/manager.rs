//! Top-level sync scheduling.
//!
//! [`WorkspaceSyncManager`] mirrors server workspace metadata into local
//! storage; [`SyncManager`] decides when a runbook pass runs (connectivity,
//! focus, elapsed time, explicit triggers), watches for stuck passes, and
//! feeds the sync universe into a [`SyncSet`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, Subscription};
use crate::models::Workspace;
use crate::remote::RemoteApi;
use crate::storage::LocalStore;

use super::mutex_registry::MutexRegistry;
use super::sync_set::{SyncSet, SyncSetEvent};
use super::synchronizer::{ContentProvider, SyncContext, SynchronizerOptions};

/// Priority lane for just-edited runbooks; backlog syncs ride lane 0.
const PRIORITY_LANE: i32 = 10;

/// Mirrors the server's workspace list into local storage and repairs
/// runbooks that fell out of their workspace's folder tree.
pub struct WorkspaceSyncManager {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    default_workspace_id: String,
}

impl WorkspaceSyncManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        default_workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            default_workspace_id: default_workspace_id.into(),
        }
    }

    /// Runs the full metadata pass: mirror, then orphan repair.
    pub async fn reconcile(&self) -> Result<(), SyncError> {
        self.mirror_workspaces().await?;
        self.reattach_orphans().await?;
        Ok(())
    }

    /// Creates, updates, and deletes local workspace records to match the
    /// server's list. The default workspace is local-only and never
    /// deleted.
    async fn mirror_workspaces(&self) -> Result<(), SyncError> {
        let remote = self.remote.workspaces().await.map_err(SyncError::from)?;
        let local = self.store.workspaces().await?;

        for remote_workspace in &remote {
            let matches_local = local.iter().any(|w| {
                w.id == remote_workspace.id
                    && w.name == remote_workspace.name
                    && w.folder == remote_workspace.folder
            });
            if matches_local {
                continue;
            }
            tracing::debug!(workspace_id = %remote_workspace.id, "mirroring workspace from hub");
            self.store
                .save_workspace(&Workspace {
                    id: remote_workspace.id.clone(),
                    name: remote_workspace.name.clone(),
                    folder: remote_workspace.folder.clone(),
                })
                .await?;
        }

        for workspace in &local {
            if workspace.id == self.default_workspace_id {
                continue;
            }
            if !remote.iter().any(|r| r.id == workspace.id) {
                tracing::info!(workspace_id = %workspace.id, "removing workspace gone from hub");
                self.store.delete_workspace(&workspace.id).await?;
            }
        }

        Ok(())
    }

    /// Every local runbook must appear in its workspace's folder tree; a
    /// runbook whose workspace vanished moves to the default workspace.
    async fn reattach_orphans(&self) -> Result<(), SyncError> {
        for id in self.store.runbook_ids().await? {
            let Some(mut runbook) = self.store.get_runbook(&id).await? else {
                continue;
            };

            let workspace = match &runbook.workspace_id {
                Some(workspace_id) => self.store.get_workspace(workspace_id).await?,
                None => None,
            };
            let mut workspace = match workspace {
                Some(workspace) => workspace,
                None => {
                    let fallback = self
                        .store
                        .get_workspace(&self.default_workspace_id)
                        .await?
                        .unwrap_or_else(|| Workspace::new(&self.default_workspace_id, "Default"));
                    runbook.workspace_id = Some(fallback.id.clone());
                    self.store.save_runbook(&runbook).await?;
                    fallback
                }
            };

            if !workspace.contains_runbook(&id) {
                tracing::debug!(runbook_id = %id, workspace_id = %workspace.id, "reattaching orphaned runbook");
                workspace.attach_runbook(&id);
                self.store.save_workspace(&workspace).await?;
            }
        }
        Ok(())
    }
}

struct ManagerState {
    online: bool,
    focused: bool,
    current_user: String,
    open_runbook: Option<String>,
    /// Runbooks edited since the last pass, in edit order.
    priority: Vec<String>,
    last_sync: Option<Instant>,
    /// Apply the shortened interval to the next pass.
    early_sync: bool,
    active_set: Option<SyncSet>,
}

struct ManagerInner {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    provider: Option<Arc<dyn ContentProvider>>,
    mutexes: MutexRegistry,
    workspace_sync: WorkspaceSyncManager,
    default_workspace_id: String,
    state: StdMutex<ManagerState>,
    events: EventBus<SyncSetEvent>,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn should_sync(&self) -> bool {
        let state = self.state.lock().unwrap();
        if !state.online || !state.focused || state.active_set.is_some() {
            return false;
        }
        let interval = if state.early_sync {
            self.config.early_sync_interval()
        } else {
            self.config.sync_interval()
        };
        match state.last_sync {
            Some(last) => last.elapsed() >= interval,
            None => true,
        }
    }

    /// One scheduler wake-up: reap a stuck pass, then start a new pass if
    /// the policy allows.
    async fn tick(self: &Arc<Self>) {
        let stuck = {
            let state = self.state.lock().unwrap();
            state.active_set.as_ref().and_then(|set| {
                set.longest_running()
                    .filter(|(_, elapsed)| *elapsed >= self.config.watchdog())
                    .map(|(id, elapsed)| (set.clone(), id, elapsed))
            })
        };
        if let Some((set, id, elapsed)) = stuck {
            tracing::warn!(
                runbook_id = %id,
                elapsed_secs = elapsed.as_secs(),
                "sync pass exceeded watchdog, force-killing"
            );
            set.force_kill(&id);
        }

        if self.should_sync() {
            self.run_pass().await;
        }
    }

    async fn run_pass(self: &Arc<Self>) {
        // Claim the pass slot before the first await; two callers racing
        // in here must not both start a pass.
        let (set, priority) = {
            let mut state = self.state.lock().unwrap();
            if state.active_set.is_some() {
                return;
            }
            let priority = std::mem::take(&mut state.priority);
            state.early_sync = false;

            let context = SyncContext {
                store: Arc::clone(&self.store),
                remote: Arc::clone(&self.remote),
                provider: self.provider.clone(),
                mutexes: self.mutexes.clone(),
                current_user: state.current_user.clone(),
                default_workspace_id: self.default_workspace_id.clone(),
            };
            let weak = Arc::downgrade(self);
            let set = SyncSet::new(context, self.config.concurrency, move |id| {
                options_for(&weak, id)
            });
            state.active_set = Some(set.clone());
            (set, priority)
        };

        if let Err(err) = self.workspace_sync.reconcile().await {
            tracing::warn!("workspace reconcile failed, deferring pass: {err}");
            self.abandon_pass(priority);
            return;
        }

        let remote_ids = match self.remote.all_runbook_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!("could not list hub runbooks, deferring pass: {err}");
                self.abandon_pass(priority);
                return;
            }
        };
        let local_ids = match self.store.runbook_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!("could not list local runbooks, deferring pass: {err}");
                self.abandon_pass(priority);
                return;
            }
        };

        let _forward = {
            let events = self.events.clone();
            set.on_event(move |event| events.emit(event))
        };

        // Priority ids first, then the server's view, then local-only ids.
        let mut seen = HashSet::new();
        for id in &priority {
            if seen.insert(id.clone()) {
                set.add_runbook(id, PRIORITY_LANE);
            }
        }
        for id in remote_ids.iter().chain(local_ids.iter()) {
            if seen.insert(id.clone()) {
                set.add_runbook(id, 0);
            }
        }

        match set.wait_done().await {
            Ok(()) => tracing::debug!(runbooks = seen.len(), "sync pass complete"),
            Err(err) => tracing::warn!("sync pass ended early: {err}"),
        }

        let mut state = self.state.lock().unwrap();
        state.active_set = None;
        state.last_sync = Some(Instant::now());
    }

    /// Releases a claimed pass slot without having synced. The priority
    /// ids go back in the queue for the next attempt.
    fn abandon_pass(&self, priority: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        state.active_set = None;
        for id in priority {
            if !state.priority.iter().any(|queued| queued == &id) {
                state.priority.push(id);
            }
        }
    }
}

fn options_for(inner: &Weak<ManagerInner>, id: &str) -> SynchronizerOptions {
    let open_runbook = inner
        .upgrade()
        .and_then(|inner| inner.state.lock().unwrap().open_runbook.clone());
    SynchronizerOptions {
        // Content resync would fight the editor on the open runbook.
        resync_content: open_runbook.as_deref() != Some(id),
        can_update: true,
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

/// Scheduler for runbook sync passes.
///
/// Owns the periodic ticker and the reaction surface the application pokes
/// on connectivity, focus, and edit events. Cheap to clone; all clones
/// share one scheduler.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        provider: Option<Arc<dyn ContentProvider>>,
        current_user: impl Into<String>,
        default_workspace_id: impl Into<String>,
    ) -> Self {
        let default_workspace_id = default_workspace_id.into();
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store: Arc::clone(&store),
                remote: Arc::clone(&remote),
                provider,
                mutexes: MutexRegistry::new(),
                workspace_sync: WorkspaceSyncManager::new(
                    store,
                    remote,
                    default_workspace_id.clone(),
                ),
                default_workspace_id,
                state: StdMutex::new(ManagerState {
                    online: true,
                    focused: true,
                    current_user: current_user.into(),
                    open_runbook: None,
                    priority: Vec::new(),
                    last_sync: None,
                    early_sync: false,
                    active_set: None,
                }),
                events: EventBus::new(),
                ticker: StdMutex::new(None),
            }),
        }
    }

    /// Starts the periodic scheduler. Idempotent.
    pub fn start(&self) {
        let mut ticker = self.inner.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.check_interval();
        *ticker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                inner.tick().await;
            }
        }));
    }

    /// Stops the scheduler and the in-flight pass, if any. With `force`,
    /// in-flight synchronizers are aborted rather than drained.
    pub fn stop(&self, force: bool) {
        if let Some(ticker) = self.inner.ticker.lock().unwrap().take() {
            ticker.abort();
        }
        let set = self.inner.state.lock().unwrap().active_set.clone();
        if let Some(set) = set {
            set.stop(force);
        }
    }

    /// Runs a pass right now unless one is already in flight.
    pub async fn sync_now(&self) {
        self.inner.run_pass().await;
    }

    /// Requests a pass at the shortened interval without running one
    /// inline.
    pub fn trigger_sync(&self) {
        self.inner.state.lock().unwrap().early_sync = true;
    }

    /// Connectivity transition. Going offline halts the in-flight pass;
    /// coming back online schedules an early pass.
    pub fn set_online(&self, online: bool) {
        let set = {
            let mut state = self.inner.state.lock().unwrap();
            if state.online == online {
                return;
            }
            state.online = online;
            if online {
                state.early_sync = true;
                None
            } else {
                state.active_set.clone()
            }
        };
        if let Some(set) = set {
            tracing::info!("went offline, stopping in-flight sync pass");
            set.stop(false);
        }
    }

    /// Focus transition. Scheduling pauses while unfocused; regaining
    /// focus schedules an early pass.
    pub fn set_focused(&self, focused: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if state.focused == focused {
            return;
        }
        state.focused = focused;
        if focused {
            state.early_sync = true;
        }
    }

    /// Identity change: abort whatever is in flight and forget all pass
    /// history so everything re-syncs as the new user.
    pub fn set_user(&self, user: impl Into<String>) {
        let user = user.into();
        let set = {
            let mut state = self.inner.state.lock().unwrap();
            if state.current_user == user {
                return;
            }
            tracing::info!(user = %user, "user changed, scheduling full re-sync");
            state.current_user = user;
            state.priority.clear();
            state.last_sync = None;
            state.early_sync = true;
            state.active_set.take()
        };
        if let Some(set) = set {
            set.stop(true);
        }
    }

    /// Marks a runbook as just-edited: injected into the in-flight pass
    /// when one is running, otherwise queued at priority for the next one.
    pub fn runbook_updated(&self, id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(set) = &state.active_set {
            set.add_runbook(id, PRIORITY_LANE);
            return;
        }
        if !state.priority.iter().any(|queued| queued == id) {
            state.priority.push(id.to_string());
        }
        state.early_sync = true;
    }

    /// Tells the scheduler which runbook the editor has open; its content
    /// resync is suppressed while open.
    pub fn set_open_runbook(&self, id: Option<&str>) {
        self.inner.state.lock().unwrap().open_runbook = id.map(str::to_string);
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.state.lock().unwrap().active_set.is_some()
    }

    /// Per-runbook outcome events forwarded from the in-flight pass.
    pub fn on_sync_event(
        &self,
        callback: impl Fn(&SyncSetEvent) + Send + Sync + 'static,
    ) -> Subscription<SyncSetEvent> {
        self.inner.events.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Runbook, RunbookSource};
    use crate::remote::{MemoryRemote, RemoteRunbook, RemoteWorkspace};
    use crate::storage::MemoryStore;
    use crate::sync::synchronizer::SyncAction;
    use chrono::Utc;
    use serde_json::json;

    fn remote_runbook(id: &str) -> RemoteRunbook {
        RemoteRunbook {
            id: id.into(),
            name: id.into(),
            content: json!([]),
            ydoc: None,
            nwo: "alice/proj".into(),
            created_by: "alice".into(),
            workspace_id: None,
            snapshots: vec![],
        }
    }

    fn local_runbook(id: &str, workspace_id: Option<&str>) -> Runbook {
        let now = Utc::now();
        Runbook {
            id: id.into(),
            name: id.into(),
            content: json!([]),
            workspace_id: workspace_id.map(str::to_string),
            source: RunbookSource::Local,
            ydoc: None,
            remote_info: None,
            created: now,
            updated: now,
        }
    }

    fn manager(store: Arc<MemoryStore>, remote: Arc<MemoryRemote>) -> SyncManager {
        SyncManager::new(
            SyncConfig::default(),
            store,
            remote,
            None,
            "alice",
            "ws-default",
        )
    }

    #[tokio::test]
    async fn test_workspace_mirror_creates_updates_deletes() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_workspace(&Workspace::new("ws-default", "Default"))
            .await
            .unwrap();
        store
            .save_workspace(&Workspace::new("ws-gone", "Stale"))
            .await
            .unwrap();
        store
            .save_workspace(&Workspace::new("ws-renamed", "Old Name"))
            .await
            .unwrap();

        let remote = Arc::new(MemoryRemote::new());
        remote.set_workspaces(vec![
            RemoteWorkspace {
                id: "ws-new".into(),
                name: "Fresh".into(),
                folder: json!({"children": []}),
            },
            RemoteWorkspace {
                id: "ws-renamed".into(),
                name: "New Name".into(),
                folder: json!({"children": []}),
            },
        ]);

        let sync = WorkspaceSyncManager::new(store.clone(), remote, "ws-default");
        sync.reconcile().await.unwrap();

        let ids: Vec<String> = store
            .workspaces()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["ws-default", "ws-new", "ws-renamed"]);
        let renamed = store.get_workspace("ws-renamed").await.unwrap().unwrap();
        assert_eq!(renamed.name, "New Name");
    }

    #[tokio::test]
    async fn test_orphaned_runbook_is_reattached() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_workspace(&Workspace::new("ws-default", "Default"))
            .await
            .unwrap();
        store
            .save_workspace(&Workspace::new("ws-1", "Ops"))
            .await
            .unwrap();
        // In ws-1 but missing from its folder tree.
        store
            .save_runbook(&local_runbook("rb-orphan", Some("ws-1")))
            .await
            .unwrap();
        // Workspace no longer exists; falls back to the default.
        store
            .save_runbook(&local_runbook("rb-lost", Some("ws-vanished")))
            .await
            .unwrap();

        // ws-1 still exists on the hub, so the mirror keeps it.
        let remote = Arc::new(MemoryRemote::new());
        remote.set_workspaces(vec![RemoteWorkspace {
            id: "ws-1".into(),
            name: "Ops".into(),
            folder: json!({"children": []}),
        }]);
        let sync = WorkspaceSyncManager::new(store.clone(), remote, "ws-default");
        sync.reconcile().await.unwrap();

        let ws1 = store.get_workspace("ws-1").await.unwrap().unwrap();
        assert!(ws1.contains_runbook("rb-orphan"));

        let lost = store.get_runbook("rb-lost").await.unwrap().unwrap();
        assert_eq!(lost.workspace_id.as_deref(), Some("ws-default"));
        let default = store.get_workspace("ws-default").await.unwrap().unwrap();
        assert!(default.contains_runbook("rb-lost"));
    }

    #[tokio::test]
    async fn test_sync_now_covers_remote_and_local_universe() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_workspace(&Workspace::new("ws-default", "Default"))
            .await
            .unwrap();
        store
            .save_runbook(&local_runbook("rb-local", Some("ws-default")))
            .await
            .unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.put_runbook(remote_runbook("rb-remote"));

        let manager = manager(store.clone(), remote);
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let outcomes_clone = Arc::clone(&outcomes);
        let _sub = manager.on_sync_event(move |event| {
            if let SyncSetEvent::Finished { outcome } = event {
                outcomes_clone
                    .lock()
                    .unwrap()
                    .push((outcome.id.clone(), outcome.action));
            }
        });

        manager.sync_now().await;

        // Hub runbook materialized locally; local-only runbook untouched.
        assert!(store.get_runbook("rb-remote").await.unwrap().is_some());
        assert!(store.get_runbook("rb-local").await.unwrap().is_some());
        let outcomes = outcomes.lock().unwrap();
        assert!(outcomes.contains(&("rb-remote".to_string(), SyncAction::Created)));
        assert!(outcomes.contains(&("rb-local".to_string(), SyncAction::Nothing)));
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_pass_slot_claim_prevents_overlapping_passes() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote.put_runbook(remote_runbook("rb-1"));
        let manager = manager(store.clone(), remote.clone());

        // Occupy the pass slot; sync_now must bail out without syncing.
        let placeholder = SyncSet::new(
            SyncContext {
                store: store.clone(),
                remote: remote.clone(),
                provider: None,
                mutexes: MutexRegistry::new(),
                current_user: "alice".into(),
                default_workspace_id: "ws-default".into(),
            },
            1,
            |_| SynchronizerOptions::default(),
        );
        manager.inner.state.lock().unwrap().active_set = Some(placeholder);
        assert!(manager.is_syncing());
        manager.sync_now().await;
        assert!(store.get_runbook("rb-1").await.unwrap().is_none());

        manager.inner.state.lock().unwrap().active_set = None;
        manager.sync_now().await;
        assert!(store.get_runbook("rb-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_defers_pass() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote.put_runbook(remote_runbook("rb-1"));
        remote.set_offline(true);

        let manager = manager(store.clone(), remote.clone());
        manager.sync_now().await;
        assert!(store.get_runbook("rb-1").await.unwrap().is_none());

        remote.set_offline(false);
        manager.sync_now().await;
        assert!(store.get_runbook("rb-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_runbook_updated_queues_priority_for_next_pass() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote.put_runbook(remote_runbook("rb-1"));

        let manager = manager(store.clone(), remote);
        manager.runbook_updated("rb-1");
        manager.runbook_updated("rb-1");
        {
            let state = manager.inner.state.lock().unwrap();
            assert_eq!(state.priority, vec!["rb-1"]);
            assert!(state.early_sync);
        }

        manager.sync_now().await;
        assert!(store.get_runbook("rb-1").await.unwrap().is_some());
        // Priority queue drained by the pass.
        assert!(manager.inner.state.lock().unwrap().priority.is_empty());
    }

    #[tokio::test]
    async fn test_should_sync_policy() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(store, remote);

        // Never synced: due immediately.
        assert!(manager.inner.should_sync());

        manager.set_focused(false);
        assert!(!manager.inner.should_sync());
        manager.set_focused(true);

        manager.set_online(false);
        assert!(!manager.inner.should_sync());
        manager.set_online(true);

        // Just synced: not due again until the interval elapses, but an
        // explicit trigger shortens the wait rather than bypassing it.
        manager.sync_now().await;
        assert!(!manager.inner.should_sync());
        manager.trigger_sync();
        assert!(!manager.inner.should_sync());
    }

    #[tokio::test]
    async fn test_set_user_resets_history() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(store, remote);

        manager.sync_now().await;
        assert!(manager.inner.state.lock().unwrap().last_sync.is_some());

        manager.set_user("bob");
        let state = manager.inner.state.lock().unwrap();
        assert_eq!(state.current_user, "bob");
        assert!(state.last_sync.is_none());
        assert!(state.early_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_runs_a_due_pass() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote.put_runbook(remote_runbook("rb-1"));

        let manager = manager(store.clone(), remote);
        manager.start();
        manager.start(); // idempotent

        // Let the ticker task register its sleep before moving the clock.
        tokio::task::yield_now().await;
        tokio::time::advance(manager.inner.config.check_interval()).await;
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }

        assert!(store.get_runbook("rb-1").await.unwrap().is_some());
        manager.stop(false);
    }

    #[tokio::test]
    async fn test_open_runbook_suppresses_content_resync() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(store, remote);
        manager.set_open_runbook(Some("rb-open"));

        let weak = Arc::downgrade(&manager.inner);
        assert!(!options_for(&weak, "rb-open").resync_content);
        assert!(options_for(&weak, "rb-other").resync_content);
    }
}
