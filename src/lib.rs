//! Runbook Sync Core
//!
//! Client-side replication engine keeping local runbooks, snapshots, and
//! workspace folder trees consistent with an authoritative server, while
//! tolerating offline operation, concurrent local edits, and partial
//! failures.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod remote;
pub mod shared_state;
pub mod storage;
pub mod sync;

pub use concurrency::{AsyncMutex, AsyncQueue, MutexGuard, Permit, QueueError};
pub use config::SyncConfig;
pub use error::{RemoteError, SyncError};
pub use events::{EventBus, Subscription};
pub use models::{RemoteInfo, Runbook, RunbookSource, Snapshot, Workspace};
pub use remote::{MemoryRemote, RemoteApi, RemoteRunbook, RemoteWorkspace, SnapshotRef};
pub use shared_state::{
    ChangeRef, Delta, OptimisticUpdate, ServerUpdate, SharedStateAdapter, SharedStateDocument,
    SharedStateHandle, SharedStateManager, SharedStateRegistry, Version, NEVER_SYNCED,
};
pub use storage::{LocalStore, MemoryStore, StoreError};
pub use sync::{
    ContentProvider, ResyncedContent, RunbookSynchronizer, SyncAction, SyncManager, SyncOutcome,
    SyncSet, SyncSetEvent, SynchronizerOptions, WorkspaceSyncManager,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
