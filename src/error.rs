//! Error types shared across the sync engine.

use thiserror::Error;

/// Errors from the remote runbook API.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The entity does not exist on the server (404).
    #[error("not found on server")]
    NotFound,

    /// The server could not be reached. Recoverable; retried next pass.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The server answered with an error payload.
    #[error("remote API error: {0}")]
    Api(String),
}

/// Errors from a runbook sync pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Failed to reach the replication channel or the server.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller cancelled the pass.
    #[error("sync cancelled")]
    Cancelled,

    /// The pass was stopped while work was still in flight.
    #[error("sync pass stopped before completion")]
    Stopped,

    /// A synchronizer exceeded the watchdog threshold and was force-killed.
    #[error("sync for {runbook_id} stuck after {elapsed_secs}s")]
    Stuck { runbook_id: String, elapsed_secs: u64 },
}

impl SyncError {
    /// Whether the next scheduled pass is expected to recover from this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity(_)
                | SyncError::Remote(RemoteError::Connectivity(_))
                | SyncError::Stuck { .. }
        )
    }
}
