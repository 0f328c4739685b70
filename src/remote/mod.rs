//! Remote runbook API boundary.
//!
//! The hub is consumed through this narrow trait; the HTTP client lives in
//! the surrounding application. A 404 surfaces as
//! [`RemoteError::NotFound`] and drives the synchronizer's delete/ignore
//! branch rather than propagating as a failure.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;
use crate::models::Snapshot;

pub use memory::MemoryRemote;

/// Reference to a snapshot the server holds, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub tag: String,
}

/// A runbook as the server reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRunbook {
    pub id: String,
    pub name: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ydoc: Option<Vec<u8>>,
    /// Name-with-owner, e.g. `alice/proj`.
    pub nwo: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRef>,
}

/// A workspace as the server reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkspace {
    pub id: String,
    pub name: String,
    pub folder: Value,
}

/// Remote entity API.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    async fn get_runbook(&self, id: &str) -> Result<RemoteRunbook, RemoteError>;
    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<(), RemoteError>;
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot, RemoteError>;
    async fn all_runbook_ids(&self) -> Result<Vec<String>, RemoteError>;
    async fn workspaces(&self) -> Result<Vec<RemoteWorkspace>, RemoteError>;
}
