//! # patchsync-core: document model for optimistic patch synchronization
//!
//! Everything here is synchronous and transport-agnostic:
//!
//! - [`patch`]: `add` / `remove` / `replace` / `test` operations addressed by path
//! - [`pointer`]: JSON Pointer parsing and formatting
//! - [`document`]: the schema-free document and atomic batch application
//! - [`inverse`]: inverse operations for undo
//! - [`history`]: undo/redo stacks
//!
//! ```
//! use patchsync_core::{Document, PatchOp};
//! use serde_json::json;
//!
//! let mut doc = Document::new();
//! doc.apply(&[PatchOp::add("/nodes/42", json!({"x": 1, "name": "bla"}))]).unwrap();
//! assert_eq!(doc.node("42").unwrap().name.as_deref(), Some("bla"));
//! ```

pub mod document;
pub mod error;
pub mod history;
pub mod inverse;
pub mod patch;
pub mod pointer;

pub use document::{Document, Node, ProjectModel};
pub use error::{PatchApplicationError, PatchError};
pub use history::{History, UndoEntry};
pub use inverse::invert;
pub use patch::{PatchBatch, PatchKind, PatchOp};
