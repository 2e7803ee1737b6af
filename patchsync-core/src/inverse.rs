//! Inverse operation generation for undo.

use serde_json::Value;

use crate::document::{self, Document};
use crate::error::PatchError;
use crate::patch::PatchOp;
use crate::pointer::{self, APPEND_TOKEN};

/// Build the operation that undoes `op`, given the document as it was
/// *before* `op` is applied.
///
/// - `add` inverts to `remove`; an `add` that overwrites an existing object
///   member inverts to `replace` with the previous value instead, and an
///   append (`-`) is pinned to the concrete index it will land on.
/// - `remove` inverts to `add` of the value currently at the path.
/// - `replace` inverts to `replace` with the value currently at the path.
/// - `test` is its own inverse.
pub fn invert(op: &PatchOp, before: &Document) -> Result<PatchOp, PatchError> {
    match op {
        PatchOp::Add { path, .. } => invert_add(path, before),
        PatchOp::Remove { path } => Ok(PatchOp::add(path.clone(), before.get(path)?.clone())),
        PatchOp::Replace { path, .. } => {
            Ok(PatchOp::replace(path.clone(), before.get(path)?.clone()))
        }
        PatchOp::Test { .. } => Ok(op.clone()),
    }
}

fn invert_add(path: &str, before: &Document) -> Result<PatchOp, PatchError> {
    let tokens = pointer::parse(path)?;
    let Some((key, parent_tokens)) = tokens.split_last() else {
        return Ok(PatchOp::replace("", before.as_value().clone()));
    };
    match document::resolve(before.as_value(), parent_tokens, path)? {
        Value::Object(map) => Ok(match map.get(key) {
            Some(previous) => PatchOp::replace(path, previous.clone()),
            None => PatchOp::remove(path),
        }),
        Value::Array(items) if key == APPEND_TOKEN => {
            let mut pinned = parent_tokens.to_vec();
            pinned.push(items.len().to_string());
            Ok(PatchOp::remove(pointer::format(&pinned)))
        }
        Value::Array(_) => Ok(PatchOp::remove(path)),
        _ => Err(PatchError::TypeMismatch(path.to_string())),
    }
}
