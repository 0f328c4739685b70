//! Wire and persisted forms of a replicated shared-state document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::delta::Delta;

/// Document version. Strictly increasing per state id.
pub type Version = i64;

/// Version of a document that has never synced with the server.
pub const NEVER_SYNCED: Version = -1;

/// Correlation id between a local optimistic edit and the server delta
/// that eventually confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeRef(Uuid);

impl ChangeRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChangeRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending local edit not yet confirmed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimisticUpdate {
    pub delta: Delta,
    pub change_ref: ChangeRef,
    /// The confirmed version this edit was made against.
    pub source_version: Version,
}

/// Persisted form of one shared state.
///
/// `value` reflects only server-confirmed deltas; the externally-visible
/// data is `value` with `optimistic_updates` replayed on top.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedStateDocument {
    pub value: Value,
    pub version: Version,
    #[serde(default)]
    pub optimistic_updates: Vec<OptimisticUpdate>,
}

impl Default for SharedStateDocument {
    fn default() -> Self {
        Self {
            value: Value::Null,
            version: NEVER_SYNCED,
            optimistic_updates: Vec::new(),
        }
    }
}

/// An incremental update pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerUpdate {
    pub version: Version,
    pub delta: Delta,
    pub change_ref: ChangeRef,
}

/// Full-state catch-up response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResyncResponse {
    pub version: Version,
    pub data: Value,
    /// Change refs of optimistic updates the server has already folded
    /// into `data`.
    #[serde(default)]
    pub change_refs: Vec<ChangeRef>,
}
