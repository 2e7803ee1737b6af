use thiserror::Error;

use crate::patch::PatchOp;

/// Why a single operation could not be applied.
///
/// Each variant carries the offending path as written in the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("path not found: {0:?}")]
    PathNotFound(String),
    #[error("type mismatch at {0:?}")]
    TypeMismatch(String),
    #[error("test failed at {0:?}")]
    TestFailed(String),
}

impl PatchError {
    /// The path the failing operation addressed.
    pub fn path(&self) -> &str {
        match self {
            Self::PathNotFound(path) | Self::TypeMismatch(path) | Self::TestFailed(path) => path,
        }
    }
}

/// A batch failed; nothing from it was applied.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("operation {index} ({kind} {path}) failed: {source}", kind = .op.kind(), path = .op.path())]
pub struct PatchApplicationError {
    /// Position of the failing operation inside its batch.
    pub index: usize,
    pub op: PatchOp,
    pub source: PatchError,
}

impl PatchApplicationError {
    pub fn new(index: usize, op: PatchOp, source: PatchError) -> Self {
        Self { index, op, source }
    }
}
