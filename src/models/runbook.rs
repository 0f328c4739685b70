use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::remote::RemoteRunbook;

/// Where a runbook originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunbookSource {
    /// Created locally; the server may not know about it.
    Local,
    /// Materialized from the hub; the server owns its lifecycle.
    Hub,
}

/// Server-side ownership details for a hub runbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// Name-with-owner, e.g. `alice/proj`.
    pub nwo: String,
    /// Username of the account that created the runbook.
    pub created_by: String,
}

/// A runbook: named block-tree content plus its CRDT document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runbook {
    pub id: String,
    pub name: String,
    /// Serialized block tree.
    pub content: Value,
    pub workspace_id: Option<String>,
    pub source: RunbookSource,
    /// CRDT document binary, when one has been materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ydoc: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_info: Option<RemoteInfo>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Runbook {
    /// Materializes a local copy of a remote runbook.
    pub fn from_remote(remote: &RemoteRunbook, workspace_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: remote.id.clone(),
            name: remote.name.clone(),
            content: remote.content.clone(),
            workspace_id: Some(workspace_id.into()),
            source: RunbookSource::Hub,
            ydoc: remote.ydoc.clone(),
            remote_info: Some(RemoteInfo {
                nwo: remote.nwo.clone(),
                created_by: remote.created_by.clone(),
            }),
            created: now,
            updated: now,
        }
    }

    /// True when the server owns this runbook's lifecycle.
    pub fn is_hub_owned(&self) -> bool {
        self.source == RunbookSource::Hub && self.remote_info.is_some()
    }

    /// Username that created this runbook on the hub, if known.
    pub fn hub_creator(&self) -> Option<&str> {
        self.remote_info.as_ref().map(|info| info.created_by.as_str())
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote() -> RemoteRunbook {
        RemoteRunbook {
            id: "rb-1".into(),
            name: "Deploy".into(),
            content: json!([{"type": "heading", "text": "Deploy"}]),
            ydoc: Some(vec![1, 2, 3]),
            nwo: "alice/proj".into(),
            created_by: "alice".into(),
            workspace_id: Some("ws-remote".into()),
            snapshots: vec![],
        }
    }

    #[test]
    fn test_from_remote_is_hub_sourced() {
        let runbook = Runbook::from_remote(&remote(), "ws-local");
        assert_eq!(runbook.source, RunbookSource::Hub);
        assert_eq!(runbook.workspace_id.as_deref(), Some("ws-local"));
        assert!(runbook.is_hub_owned());
        assert_eq!(runbook.hub_creator(), Some("alice"));
        assert_eq!(runbook.ydoc.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_local_runbook_is_not_hub_owned() {
        let mut runbook = Runbook::from_remote(&remote(), "ws");
        runbook.source = RunbookSource::Local;
        assert!(!runbook.is_hub_owned());
    }

    #[test]
    fn test_serde_roundtrip() {
        let runbook = Runbook::from_remote(&remote(), "ws");
        let encoded = serde_json::to_string(&runbook).unwrap();
        let decoded: Runbook = serde_json::from_str(&encoded).unwrap();
        assert_eq!(runbook, decoded);
    }
}
