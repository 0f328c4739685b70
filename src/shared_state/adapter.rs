//! Transport and persistence boundary for one shared state.
//!
//! The adapter wraps whatever reliable ordered channel the application
//! provides (WebSocket, IPC, in-process for tests) plus the local
//! persisted snapshot of the document. The manager never sees wire bytes.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::document::{
    OptimisticUpdate, ResyncResponse, ServerUpdate, SharedStateDocument, Version,
};

#[derive(Error, Debug)]
pub enum AdapterError {
    /// Channel join/push/resync failed; recovered by the next attempt.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The state id is unknown to the server.
    #[error("shared state not found on server")]
    NotFound,

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Boundary contract for one document's replication channel and its
/// locally persisted snapshot.
#[async_trait]
pub trait SharedStateAdapter: Send + Sync + 'static {
    /// Joins the document's replication channel.
    async fn join(&self) -> Result<(), AdapterError>;

    /// Pushes a client update to the server.
    ///
    /// The manager calls this fire-and-forget: a failure leaves the update
    /// valid locally and it is retried through the next resync.
    async fn push(&self, update: OptimisticUpdate) -> Result<(), AdapterError>;

    /// Requests a full-state catch-up from `last_known`.
    async fn resync_request(&self, last_known: Version) -> Result<ResyncResponse, AdapterError>;

    /// Idempotent reconnect.
    async fn ensure_connected(&self) -> Result<(), AdapterError>;

    /// Takes the server→client update stream. Yields `Some` exactly once;
    /// the manager consumes it from its pump task.
    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<ServerUpdate>>;

    /// Loads the locally persisted snapshot, if any.
    async fn get_document(&self) -> Result<Option<SharedStateDocument>, AdapterError>;

    /// Persists the confirmed `(value, version)` pair.
    async fn save_document(&self, value: &Value, version: Version) -> Result<(), AdapterError>;

    /// Persists the current optimistic-update log.
    async fn save_optimistic_updates(
        &self,
        updates: &[OptimisticUpdate],
    ) -> Result<(), AdapterError>;

    /// Leaves the replication channel and drops transport resources.
    fn destroy(&self) {}
}
