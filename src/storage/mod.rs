//! Local persistence boundary.
//!
//! The engine only needs get/save/delete by id plus id enumeration; the
//! surrounding application decides what backs it (SQLite, key/value, or
//! the in-memory store for tests and ephemeral embedders).

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SyncError;
use crate::models::{Runbook, Snapshot, Workspace};

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Local store for runbooks, snapshots, and workspaces.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    async fn get_runbook(&self, id: &str) -> Result<Option<Runbook>, StoreError>;
    async fn save_runbook(&self, runbook: &Runbook) -> Result<(), StoreError>;
    async fn delete_runbook(&self, id: &str) -> Result<(), StoreError>;
    async fn runbook_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Snapshots persisted locally for one runbook.
    async fn snapshots_for(&self, runbook_id: &str) -> Result<Vec<Snapshot>, StoreError>;
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError>;
    async fn workspaces(&self) -> Result<Vec<Workspace>, StoreError>;
    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError>;
    async fn delete_workspace(&self, id: &str) -> Result<(), StoreError>;
}
