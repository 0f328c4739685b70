//! Per-document optimistic-update replication.
//!
//! A shared state is a JSON document (for example a workspace folder tree)
//! replicated against the server with a strictly-increasing version
//! counter. Local edits apply optimistically and are reconciled against
//! server updates by [`SharedStateManager`]; version gaps fall back to a
//! full-state resync through the [`SharedStateAdapter`].

mod adapter;
mod delta;
mod document;
mod manager;
mod memory;
mod registry;

pub use adapter::{AdapterError, SharedStateAdapter};
pub use memory::MemoryAdapter;
pub use delta::{diff, patch, Delta, DeltaError, PatchOp};
pub use document::{
    ChangeRef, OptimisticUpdate, ResyncResponse, ServerUpdate, SharedStateDocument, Version,
    NEVER_SYNCED,
};
pub use manager::SharedStateManager;
pub use registry::{SharedStateHandle, SharedStateRegistry};
