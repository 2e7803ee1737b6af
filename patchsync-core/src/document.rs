//! The shared document and patch application.
//!
//! A [`Document`] is a schema-free JSON tree. Patches address it by
//! JSON Pointer; [`ProjectModel`] is the typed view of the structural
//! shape collaborating peers agree on:
//!
//! ```text
//! { "nodes": { "<id>": { "name": "…", "x": 1 } } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PatchApplicationError, PatchError};
use crate::patch::PatchOp;
use crate::pointer::{self, APPEND_TOKEN};

/// One entry of the `nodes` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
}

impl Node {
    pub fn new(name: impl Into<String>, x: i64) -> Self {
        Self {
            name: Some(name.into()),
            x: Some(x),
        }
    }
}

/// Typed projection of a well-shaped document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectModel {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

/// A mutable JSON tree, changed only through patch application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    root: Value,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty project: `{"nodes": {}}`.
    pub fn new() -> Self {
        Self {
            root: json!({ "nodes": {} }),
        }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_model(model: &ProjectModel) -> Self {
        // A map of plain structs always serializes.
        Self {
            root: serde_json::to_value(model).unwrap_or_else(|_| json!({ "nodes": {} })),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// Value at `path`.
    pub fn get(&self, path: &str) -> Result<&Value, PatchError> {
        let tokens = pointer::parse(path)?;
        resolve(&self.root, &tokens, path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Check the document against the agreed structural shape.
    pub fn to_model(&self) -> Result<ProjectModel, serde_json::Error> {
        ProjectModel::deserialize(&self.root)
    }

    /// Typed node lookup; `None` when absent or malformed.
    pub fn node(&self, id: &str) -> Option<Node> {
        let node = self.root.get("nodes")?.get(id)?;
        Node::deserialize(node).ok()
    }

    pub fn node_count(&self) -> usize {
        self.root
            .get("nodes")
            .and_then(Value::as_object)
            .map_or(0, |nodes| nodes.len())
    }

    /// Apply a batch atomically.
    ///
    /// Either every operation is applied in order or the document is left
    /// untouched and the first failing operation is reported.
    pub fn apply(&mut self, batch: &[PatchOp]) -> Result<(), PatchApplicationError> {
        // Single operations validate before mutating, so only multi-op
        // batches need a staged copy.
        if let [op] = batch {
            return apply_op(&mut self.root, op)
                .map_err(|source| PatchApplicationError::new(0, op.clone(), source));
        }

        let mut staged = self.root.clone();
        for (index, op) in batch.iter().enumerate() {
            if let Err(source) = apply_op(&mut staged, op) {
                log::trace!("discarding staged batch of {} at operation {index}", batch.len());
                return Err(PatchApplicationError::new(index, op.clone(), source));
            }
        }
        self.root = staged;
        Ok(())
    }

    /// Apply one operation atomically.
    pub fn apply_op(&mut self, op: &PatchOp) -> Result<(), PatchError> {
        apply_op(&mut self.root, op)
    }
}

impl From<ProjectModel> for Document {
    fn from(model: ProjectModel) -> Self {
        Self::from_model(&model)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pretty = serde_json::to_string_pretty(&self.root).map_err(|_| fmt::Error)?;
        f.write_str(&pretty)
    }
}

// ── Path resolution ──────────────────────────────────────────────────────

pub(crate) fn resolve<'a>(
    root: &'a Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a Value, PatchError> {
    let mut current = root;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get(token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = pointer::array_index(token, path)?;
                items
                    .get(index)
                    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?
            }
            _ => return Err(PatchError::TypeMismatch(path.to_string())),
        };
    }
    Ok(current)
}

fn resolve_mut<'a>(
    root: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = root;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = pointer::array_index(token, path)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?
            }
            _ => return Err(PatchError::TypeMismatch(path.to_string())),
        };
    }
    Ok(current)
}

// ── Operation applicators ────────────────────────────────────────────────
//
// Each applicator resolves and validates its target completely before the
// first write, so a failed operation never leaves a partial mutation.

fn apply_op(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Add { path, value } => apply_add(root, path, value),
        PatchOp::Remove { path } => apply_remove(root, path),
        PatchOp::Replace { path, value } => apply_replace(root, path, value),
        PatchOp::Test { path, value } => apply_test(root, path, value),
    }
}

fn apply_add(root: &mut Value, path: &str, value: &Value) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((key, parent_tokens)) = tokens.split_last() else {
        *root = value.clone();
        return Ok(());
    };
    match resolve_mut(root, parent_tokens, path)? {
        Value::Object(map) => {
            map.insert(key.clone(), value.clone());
        }
        Value::Array(items) => {
            if key == APPEND_TOKEN {
                items.push(value.clone());
            } else {
                let index = pointer::array_index(key, path)?;
                if index > items.len() {
                    return Err(PatchError::PathNotFound(path.to_string()));
                }
                items.insert(index, value.clone());
            }
        }
        _ => return Err(PatchError::TypeMismatch(path.to_string())),
    }
    Ok(())
}

fn apply_remove(root: &mut Value, path: &str) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((key, parent_tokens)) = tokens.split_last() else {
        // the root itself cannot be removed
        return Err(PatchError::TypeMismatch(path.to_string()));
    };
    match resolve_mut(root, parent_tokens, path)? {
        Value::Object(map) => {
            map.remove(key)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
        }
        Value::Array(items) => {
            let index = pointer::array_index(key, path)?;
            if index >= items.len() {
                return Err(PatchError::PathNotFound(path.to_string()));
            }
            items.remove(index);
        }
        _ => return Err(PatchError::TypeMismatch(path.to_string())),
    }
    Ok(())
}

fn apply_replace(root: &mut Value, path: &str, value: &Value) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    let target = resolve_mut(root, &tokens, path)?;
    *target = value.clone();
    Ok(())
}

fn apply_test(root: &Value, path: &str, value: &Value) -> Result<(), PatchError> {
    let tokens = pointer::parse(path)?;
    if resolve(root, &tokens, path)? != value {
        return Err(PatchError::TestFailed(path.to_string()));
    }
    Ok(())
}
