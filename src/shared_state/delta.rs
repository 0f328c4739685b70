//! Structural JSON diff and patch.
//!
//! A [`Delta`] is the ordered list of operations turning one JSON snapshot
//! into another. Objects are compared key-wise; arrays and scalars are
//! replaced atomically. An empty delta means "no change" and is rejected
//! by [`patch`]; callers must special-case it instead of applying it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeltaError {
    /// An empty delta must never be applied; it represents "no change".
    #[error("attempted to apply an empty delta")]
    EmptyDelta,

    /// An operation's path does not resolve inside the target document.
    #[error("patch path does not exist: /{0}")]
    BadPath(String),
}

/// One step of a structural diff. Paths are object-key chains from the
/// document root; an empty path addresses the root itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add { path: Vec<String>, value: Value },
    Replace { path: Vec<String>, value: Value },
    Remove { path: Vec<String> },
}

impl PatchOp {
    fn path(&self) -> &[String] {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

/// A structural diff between two JSON snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Delta(pub Vec<PatchOp>);

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Computes the delta turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Delta {
    let mut ops = Vec::new();
    diff_at(&mut Vec::new(), before, after, &mut ops);
    Delta(ops)
}

fn diff_at(path: &mut Vec<String>, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, before_value) in a {
                match b.get(key) {
                    Some(after_value) => {
                        if before_value != after_value {
                            path.push(key.clone());
                            diff_at(path, before_value, after_value, ops);
                            path.pop();
                        }
                    }
                    None => {
                        let mut removed = path.clone();
                        removed.push(key.clone());
                        ops.push(PatchOp::Remove { path: removed });
                    }
                }
            }
            for (key, after_value) in b {
                if !a.contains_key(key) {
                    let mut added = path.clone();
                    added.push(key.clone());
                    ops.push(PatchOp::Add {
                        path: added,
                        value: after_value.clone(),
                    });
                }
            }
        }
        (a, b) => {
            if a != b {
                ops.push(PatchOp::Replace {
                    path: path.clone(),
                    value: b.clone(),
                });
            }
        }
    }
}

/// Applies `delta` to `base`, producing the patched document.
///
/// Fails with [`DeltaError::EmptyDelta`] for an empty delta and
/// [`DeltaError::BadPath`] when an operation's parent path is missing.
pub fn patch(base: &Value, delta: &Delta) -> Result<Value, DeltaError> {
    if delta.is_empty() {
        return Err(DeltaError::EmptyDelta);
    }

    let mut result = base.clone();
    for op in &delta.0 {
        apply_op(&mut result, op)?;
    }
    Ok(result)
}

fn apply_op(target: &mut Value, op: &PatchOp) -> Result<(), DeltaError> {
    let path = op.path();

    if path.is_empty() {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *target = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => {
                *target = Value::Null;
                Ok(())
            }
        };
    }

    let (leaf, parents) = path.split_last().unwrap();
    let mut cursor = &mut *target;
    for segment in parents {
        cursor = cursor
            .as_object_mut()
            .and_then(|obj| obj.get_mut(segment))
            .ok_or_else(|| DeltaError::BadPath(path.join("/")))?;
    }
    let parent: &mut Map<String, Value> = cursor
        .as_object_mut()
        .ok_or_else(|| DeltaError::BadPath(path.join("/")))?;

    match op {
        PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
            parent.insert(leaf.clone(), value.clone());
            Ok(())
        }
        PatchOp::Remove { .. } => {
            parent
                .remove(leaf)
                .map(|_| ())
                .ok_or_else(|| DeltaError::BadPath(path.join("/")))
        }
    }
}
