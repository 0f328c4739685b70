//! Entity-level sync: per-runbook reconciliation passes, the bounded
//! batch runner, and the scheduler that decides when passes happen.

pub mod manager;
pub mod mutex_registry;
pub mod sync_set;
pub mod synchronizer;

pub use manager::{SyncManager, WorkspaceSyncManager};
pub use mutex_registry::{EntityGuard, MutexRegistry};
pub use sync_set::{SyncSet, SyncSetEvent};
pub use synchronizer::{
    ContentProvider, ResyncedContent, RunbookSynchronizer, SyncAction, SyncContext, SyncOutcome,
    SynchronizerOptions,
};
