use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable named version of a runbook's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// User-facing tag, e.g. `v1.2`. Unique per runbook.
    pub tag: String,
    pub runbook_id: String,
    pub content: Value,
}
