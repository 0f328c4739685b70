//! In-memory [`RemoteApi`] implementation: a scriptable fake hub.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::Snapshot;

use super::{RemoteApi, RemoteRunbook, RemoteWorkspace, SnapshotRef};

/// Fake hub for tests and offline embedders. Seed it with runbooks,
/// snapshots, and workspaces; flip `set_offline` to simulate connectivity
/// failures.
#[derive(Default)]
pub struct MemoryRemote {
    runbooks: StdMutex<HashMap<String, RemoteRunbook>>,
    snapshots: StdMutex<HashMap<String, Snapshot>>,
    workspaces: StdMutex<Vec<RemoteWorkspace>>,
    offline: StdMutex<bool>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_runbook(&self, runbook: RemoteRunbook) {
        self.runbooks
            .lock()
            .unwrap()
            .insert(runbook.id.clone(), runbook);
    }

    pub fn remove_runbook(&self, id: &str) {
        self.runbooks.lock().unwrap().remove(id);
    }

    /// Stores a snapshot and registers it on its runbook.
    pub fn put_snapshot(&self, snapshot: Snapshot) {
        if let Some(runbook) = self.runbooks.lock().unwrap().get_mut(&snapshot.runbook_id) {
            runbook.snapshots.push(SnapshotRef {
                id: snapshot.id.clone(),
                tag: snapshot.tag.clone(),
            });
        }
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_workspaces(&self, workspaces: Vec<RemoteWorkspace>) {
        *self.workspaces.lock().unwrap() = workspaces;
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Snapshots pushed by the client, by tag, for one runbook.
    pub fn snapshot_tags(&self, runbook_id: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|snapshot| snapshot.runbook_id == runbook_id)
            .map(|snapshot| snapshot.tag.clone())
            .collect();
        tags.sort();
        tags
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if *self.offline.lock().unwrap() {
            Err(RemoteError::Connectivity("hub unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn get_runbook(&self, id: &str) -> Result<RemoteRunbook, RemoteError> {
        self.check_online()?;
        self.runbooks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<(), RemoteError> {
        self.check_online()?;
        self.put_snapshot(snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot, RemoteError> {
        self.check_online()?;
        self.snapshots
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn all_runbook_ids(&self) -> Result<Vec<String>, RemoteError> {
        self.check_online()?;
        let mut ids: Vec<String> = self.runbooks.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn workspaces(&self) -> Result<Vec<RemoteWorkspace>, RemoteError> {
        self.check_online()?;
        Ok(self.workspaces.lock().unwrap().clone())
    }
}
