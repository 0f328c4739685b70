//! In-memory [`LocalStore`] implementation.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use crate::models::{Runbook, Snapshot, Workspace};

use super::{LocalStore, StoreError};

/// Hash-map-backed store. Cheap to clone state out of; every method is
/// effectively synchronous.
#[derive(Default)]
pub struct MemoryStore {
    runbooks: StdMutex<HashMap<String, Runbook>>,
    snapshots: StdMutex<HashMap<String, Snapshot>>,
    workspaces: StdMutex<HashMap<String, Workspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_runbook(&self, id: &str) -> Result<Option<Runbook>, StoreError> {
        Ok(self.runbooks.lock().unwrap().get(id).cloned())
    }

    async fn save_runbook(&self, runbook: &Runbook) -> Result<(), StoreError> {
        self.runbooks
            .lock()
            .unwrap()
            .insert(runbook.id.clone(), runbook.clone());
        Ok(())
    }

    async fn delete_runbook(&self, id: &str) -> Result<(), StoreError> {
        self.runbooks.lock().unwrap().remove(id);
        self.snapshots
            .lock()
            .unwrap()
            .retain(|_, snapshot| snapshot.runbook_id != id);
        Ok(())
    }

    async fn runbook_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.runbooks.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn snapshots_for(&self, runbook_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots: Vec<Snapshot> = self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|snapshot| snapshot.runbook_id == runbook_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(snapshots)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError> {
        Ok(self.workspaces.lock().unwrap().get(id).cloned())
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let mut workspaces: Vec<Workspace> =
            self.workspaces.lock().unwrap().values().cloned().collect();
        workspaces.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workspaces)
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        self.workspaces
            .lock()
            .unwrap()
            .insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn delete_workspace(&self, id: &str) -> Result<(), StoreError> {
        self.workspaces.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunbookSource;
    use chrono::Utc;
    use serde_json::json;

    fn runbook(id: &str) -> Runbook {
        let now = Utc::now();
        Runbook {
            id: id.into(),
            name: format!("Runbook {id}"),
            content: json!([]),
            workspace_id: None,
            source: RunbookSource::Local,
            ydoc: None,
            remote_info: None,
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn test_runbook_roundtrip_and_ids() {
        let store = MemoryStore::new();
        assert!(store.get_runbook("rb-1").await.unwrap().is_none());

        store.save_runbook(&runbook("rb-1")).await.unwrap();
        store.save_runbook(&runbook("rb-2")).await.unwrap();

        assert_eq!(store.runbook_ids().await.unwrap(), vec!["rb-1", "rb-2"]);
        assert!(store.get_runbook("rb-1").await.unwrap().is_some());

        store.delete_runbook("rb-1").await.unwrap();
        assert!(store.get_runbook("rb-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleting_runbook_drops_its_snapshots() {
        let store = MemoryStore::new();
        store.save_runbook(&runbook("rb-1")).await.unwrap();
        store
            .save_snapshot(&Snapshot {
                id: "snap-1".into(),
                tag: "v1".into(),
                runbook_id: "rb-1".into(),
                content: json!([]),
            })
            .await
            .unwrap();

        assert_eq!(store.snapshots_for("rb-1").await.unwrap().len(), 1);
        store.delete_runbook("rb-1").await.unwrap();
        assert!(store.snapshots_for("rb-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workspace_roundtrip() {
        let store = MemoryStore::new();
        let workspace = Workspace::new("ws-1", "Ops");
        store.save_workspace(&workspace).await.unwrap();
        assert_eq!(store.get_workspace("ws-1").await.unwrap(), Some(workspace));

        store.delete_workspace("ws-1").await.unwrap();
        assert!(store.workspaces().await.unwrap().is_empty());
    }
}
