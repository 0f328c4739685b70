use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A workspace: a named folder tree organizing runbooks.
///
/// The folder tree is the JSON shape replicated as shared state
/// (`workspace-folder:<id>`): nested `folder` nodes with `children`, and
/// `runbook` leaves carrying the runbook id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub folder: Value,
}

impl Workspace {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: json!({"children": []}),
        }
    }

    /// Whether any node of the folder tree references `runbook_id`.
    pub fn contains_runbook(&self, runbook_id: &str) -> bool {
        fn walk(node: &Value, runbook_id: &str) -> bool {
            if node.get("type").and_then(Value::as_str) == Some("runbook")
                && node.get("id").and_then(Value::as_str) == Some(runbook_id)
            {
                return true;
            }
            node.get("children")
                .and_then(Value::as_array)
                .is_some_and(|children| children.iter().any(|child| walk(child, runbook_id)))
        }
        walk(&self.folder, runbook_id)
    }

    /// Attaches a runbook at the folder tree root. No-op if it is already
    /// present anywhere in the tree.
    pub fn attach_runbook(&mut self, runbook_id: &str) {
        if self.contains_runbook(runbook_id) {
            return;
        }
        let children = self
            .folder
            .as_object_mut()
            .map(|root| root.entry("children").or_insert_with(|| json!([])));
        if let Some(Value::Array(children)) = children {
            children.push(json!({"type": "runbook", "id": runbook_id}));
        }
    }

    /// Ids of every runbook referenced by the folder tree.
    pub fn runbook_ids(&self) -> Vec<String> {
        fn walk(node: &Value, out: &mut Vec<String>) {
            if node.get("type").and_then(Value::as_str) == Some("runbook") {
                if let Some(id) = node.get("id").and_then(Value::as_str) {
                    out.push(id.to_string());
                }
            }
            if let Some(children) = node.get("children").and_then(Value::as_array) {
                for child in children {
                    walk(child, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.folder, &mut out);
        out
    }
}
