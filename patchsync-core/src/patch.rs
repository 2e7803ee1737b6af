//! Patch operations: the atomic, path-addressed edits exchanged by peers.
//!
//! Wire shape (JSON):
//! ```text
//! { "kind": "add" | "remove" | "replace" | "test", "path": "/nodes/42", "value": … }
//! ```
//! `value` is absent for `remove`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An ordered group of operations applied all-or-nothing.
pub type PatchBatch = Vec<PatchOp>;

/// A single edit instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a value; overwrites an existing object member.
    Add { path: String, value: Value },
    /// Delete the value at `path`, which must exist.
    Remove { path: String },
    /// Swap the value at `path`, which must exist.
    Replace { path: String, value: Value },
    /// Assert the value at `path` without mutating anything.
    Test { path: String, value: Value },
}

/// Discriminant of a [`PatchOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    Add,
    Remove,
    Replace,
    Test,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::Add => "add",
            PatchKind::Remove => "remove",
            PatchKind::Replace => "replace",
            PatchKind::Test => "test",
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::Add { path: path.into(), value }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::Replace { path: path.into(), value }
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Self::Test { path: path.into(), value }
    }

    pub fn kind(&self) -> PatchKind {
        match self {
            Self::Add { .. } => PatchKind::Add,
            Self::Remove { .. } => PatchKind::Remove,
            Self::Replace { .. } => PatchKind::Replace,
            Self::Test { .. } => PatchKind::Test,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Test { path, .. } => path,
        }
    }

    /// The operand, if this kind carries one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Replace { value, .. } | Self::Test { value, .. } => {
                Some(value)
            }
            Self::Remove { .. } => None,
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{} {} {}", self.kind(), self.path(), value),
            None => write!(f, "{} {}", self.kind(), self.path()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_wire_shape() {
        let op = PatchOp::add("/nodes/42", json!({"x": 1, "name": "bla"}));
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "add", "path": "/nodes/42", "value": {"x": 1, "name": "bla"}})
        );
    }

    #[test]
    fn test_remove_has_no_value() {
        let encoded = serde_json::to_value(PatchOp::remove("/nodes/42")).unwrap();
        assert_eq!(encoded, json!({"kind": "remove", "path": "/nodes/42"}));
    }

    #[test]
    fn test_decode_replace() {
        let op: PatchOp = serde_json::from_value(
            json!({"kind": "replace", "path": "/nodes/1/name", "value": "new name!"}),
        )
        .unwrap();
        assert_eq!(op, PatchOp::replace("/nodes/1/name", json!("new name!")));
        assert_eq!(op.kind(), PatchKind::Replace);
        assert_eq!(op.path(), "/nodes/1/name");
    }

    #[test]
    fn test_decode_null_value_is_kept() {
        let op: PatchOp =
            serde_json::from_value(json!({"kind": "add", "path": "/a", "value": null})).unwrap();
        assert_eq!(op.value(), Some(&Value::Null));
    }

    #[test]
    fn test_decode_rejects_missing_value() {
        let result: Result<PatchOp, _> =
            serde_json::from_value(json!({"kind": "replace", "path": "/a"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let result: Result<PatchOp, _> =
            serde_json::from_value(json!({"kind": "frobnicate", "path": "/a"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(PatchOp::remove("/nodes/7").to_string(), "remove /nodes/7");
        assert_eq!(PatchOp::replace("/nodes/7/x", json!(3)).to_string(), "replace /nodes/7/x 3");
    }
}
