//! One reconciliation pass for one runbook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RemoteError, SyncError};
use crate::models::Runbook;
use crate::remote::{RemoteApi, RemoteRunbook};
use crate::storage::LocalStore;

use super::mutex_registry::MutexRegistry;

/// What a sync pass did to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    Nothing,
}

/// Result of one runbook's sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub id: String,
    pub action: SyncAction,
}

/// Per-pass options.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizerOptions {
    /// Run the CRDT-level content resync. Suppressed for the runbook
    /// currently open in the editor so live editing is not disrupted.
    pub resync_content: bool,
    /// Whether the current session may write to this runbook on the hub.
    pub can_update: bool,
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self {
            resync_content: true,
            can_update: true,
        }
    }
}

/// Result of a CRDT-level content resync.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncedContent {
    pub ydoc: Vec<u8>,
    pub content: Value,
}

/// External provider performing CRDT-level content sync; the engine never
/// touches CRDT internals itself.
#[async_trait]
pub trait ContentProvider: Send + Sync + 'static {
    async fn resync(
        &self,
        runbook_id: &str,
        ydoc: Option<&[u8]>,
    ) -> Result<ResyncedContent, SyncError>;
}

/// Shared dependencies for synchronizer passes.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub provider: Option<Arc<dyn ContentProvider>>,
    pub mutexes: MutexRegistry,
    /// Username of the current session.
    pub current_user: String,
    /// Workspace runbooks land in when no local workspace matches.
    pub default_workspace_id: String,
}

/// Reconciles one runbook between local storage and the server.
///
/// Constructed fresh per attempt and discarded after; everything it needs
/// is re-derived from storage each time. The whole pass runs under the
/// runbook's registry mutex, so overlapping triggers serialize.
pub struct RunbookSynchronizer {
    runbook_id: String,
    context: SyncContext,
    options: SynchronizerOptions,
    cancelled: Arc<AtomicBool>,
}

impl RunbookSynchronizer {
    pub fn new(
        runbook_id: impl Into<String>,
        context: SyncContext,
        options: SynchronizerOptions,
    ) -> Self {
        Self {
            runbook_id: runbook_id.into(),
            context,
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn runbook_id(&self) -> &str {
        &self.runbook_id
    }

    /// Flags the in-flight pass to fail with [`SyncError::Cancelled`] at
    /// its next checkpoint.
    pub fn cancel_sync(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Watchdog escape hatch: releases the per-entity mutex even while a
    /// wedged pass still notionally holds it.
    pub fn force_unlock_mutex(&self) {
        self.context.mutexes.force_unlock(&self.runbook_id);
    }

    fn checkpoint(&self) -> Result<(), SyncError> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs the reconciliation pass.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let _guard = self.context.mutexes.acquire(&self.runbook_id).await;
        self.checkpoint()?;

        let local = self.context.store.get_runbook(&self.runbook_id).await?;
        let remote = match self.context.remote.get_runbook(&self.runbook_id).await {
            Ok(remote) => Some(remote),
            Err(RemoteError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };
        self.checkpoint()?;

        let outcome = match (local, remote) {
            (Some(local), None) => self.reconcile_remote_missing(local).await?,
            (None, Some(remote)) => {
                let runbook = self.materialize_local(&remote).await?;
                self.reconcile_content(runbook, &remote, SyncAction::Created)
                    .await?
            }
            (Some(local), Some(remote)) => {
                self.reconcile_content(local, &remote, SyncAction::Updated)
                    .await?
            }
            (None, None) => SyncAction::Nothing,
        };

        Ok(SyncOutcome {
            id: self.runbook_id.clone(),
            action: outcome,
        })
    }

    /// The server no longer has this runbook. Local copies that the hub
    /// owns but a different user created are deleted; everything else is
    /// left untouched.
    async fn reconcile_remote_missing(&self, local: Runbook) -> Result<SyncAction, SyncError> {
        let foreign_hub_copy =
            local.is_hub_owned() && local.hub_creator() != Some(self.context.current_user.as_str());
        if foreign_hub_copy {
            tracing::info!(
                runbook_id = %self.runbook_id,
                "remote runbook gone, deleting hub-owned local copy"
            );
            self.context.store.delete_runbook(&self.runbook_id).await?;
            Ok(SyncAction::Deleted)
        } else {
            Ok(SyncAction::Nothing)
        }
    }

    /// Materializes a local runbook from the remote copy, preferring a
    /// local workspace matching the remote one and falling back to the
    /// default workspace.
    async fn materialize_local(&self, remote: &RemoteRunbook) -> Result<Runbook, SyncError> {
        let workspace_id = match &remote.workspace_id {
            Some(id) => match self.context.store.get_workspace(id).await? {
                Some(workspace) => workspace.id,
                None => self.context.default_workspace_id.clone(),
            },
            None => self.context.default_workspace_id.clone(),
        };
        tracing::debug!(
            runbook_id = %self.runbook_id,
            workspace_id = %workspace_id,
            "materializing local runbook from hub"
        );
        Ok(Runbook::from_remote(remote, workspace_id))
    }

    /// Snapshot reconciliation, optional content resync, persist.
    async fn reconcile_content(
        &self,
        mut runbook: Runbook,
        remote: &RemoteRunbook,
        action: SyncAction,
    ) -> Result<SyncAction, SyncError> {
        self.reconcile_snapshots(remote).await?;
        self.checkpoint()?;

        if self.options.resync_content && self.options.can_update {
            if let Some(provider) = &self.context.provider {
                match provider.resync(&self.runbook_id, runbook.ydoc.as_deref()).await {
                    Ok(resynced) => {
                        runbook.ydoc = Some(resynced.ydoc);
                        runbook.content = resynced.content;
                    }
                    Err(err) => {
                        // Content rides the next pass; the entity-level
                        // reconciliation is still worth persisting.
                        tracing::warn!(
                            runbook_id = %self.runbook_id,
                            "content resync failed: {err}"
                        );
                    }
                }
            }
        }
        self.checkpoint()?;

        runbook.touch();
        self.context.store.save_runbook(&runbook).await?;
        Ok(action)
    }

    /// Pushes local-only snapshot tags to the server and fetches
    /// remote-only ones, tolerating per-snapshot failures.
    async fn reconcile_snapshots(&self, remote: &RemoteRunbook) -> Result<(), SyncError> {
        let local = self.context.store.snapshots_for(&self.runbook_id).await?;

        for snapshot in &local {
            let known_remotely = remote.snapshots.iter().any(|r| r.tag == snapshot.tag);
            if known_remotely {
                continue;
            }
            if let Err(err) = self.context.remote.create_snapshot(snapshot).await {
                tracing::warn!(
                    runbook_id = %self.runbook_id,
                    tag = %snapshot.tag,
                    "failed to push snapshot: {err}"
                );
            }
        }

        for snapshot_ref in &remote.snapshots {
            let known_locally = local.iter().any(|s| s.tag == snapshot_ref.tag);
            if known_locally {
                continue;
            }
            match self.context.remote.get_snapshot(&snapshot_ref.id).await {
                Ok(snapshot) => self.context.store.save_snapshot(&snapshot).await?,
                Err(err) => {
                    tracing::warn!(
                        runbook_id = %self.runbook_id,
                        tag = %snapshot_ref.tag,
                        "failed to fetch snapshot: {err}"
                    );
                }
            }
        }

        Ok(())
    }
}
