//! Undo/redo stacks.
//!
//! Entries are captured when an edit is about to be applied. Issuing the
//! popped operations (and deciding where the entry goes next) is the job of
//! whoever owns the send path; this module only keeps the two stacks.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::document::Document;
use crate::error::PatchError;
use crate::inverse::invert;
use crate::patch::PatchOp;

/// A forward edit paired with the operation that reverts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub forward: PatchOp,
    pub inverse: PatchOp,
    /// Sequence number of the batch that last issued this entry's
    /// operation (the edit itself, or its undo/redo).
    #[serde(default)]
    pub batch: u64,
}

impl UndoEntry {
    /// Pair `forward` with its inverse computed against `before`.
    pub fn new(forward: PatchOp, before: &Document, batch: u64) -> Result<Self, PatchError> {
        let inverse = invert(&forward, before)?;
        Ok(Self {
            forward,
            inverse,
            batch,
        })
    }
}

/// Two LIFO stacks of [`UndoEntry`].
#[derive(Debug, Clone, Default)]
pub struct History {
    undo: VecDeque<UndoEntry>,
    redo: VecDeque<UndoEntry>,
    /// Maximum entries kept per stack; the oldest are dropped first.
    limit: Option<usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Record a new forward edit. Clears the redo stack.
    pub fn record_edit(
        &mut self,
        op: &PatchOp,
        before: &Document,
        batch: u64,
    ) -> Result<(), PatchError> {
        let entry = UndoEntry::new(op.clone(), before, batch)?;
        self.push_edit(entry);
        Ok(())
    }

    /// Record an entry computed ahead of time. Clears the redo stack.
    pub fn push_edit(&mut self, entry: UndoEntry) {
        self.redo.clear();
        self.push_undo(entry);
    }

    /// Push onto the undo stack without touching redo history.
    pub fn push_undo(&mut self, entry: UndoEntry) {
        Self::push_bounded(&mut self.undo, entry, self.limit);
    }

    pub fn push_redo(&mut self, entry: UndoEntry) {
        Self::push_bounded(&mut self.redo, entry, self.limit);
    }

    pub fn pop_undo(&mut self) -> Option<UndoEntry> {
        self.undo.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<UndoEntry> {
        self.redo.pop_back()
    }

    pub fn peek_undo(&self) -> Option<&UndoEntry> {
        self.undo.back()
    }

    pub fn peek_redo(&self) -> Option<&UndoEntry> {
        self.redo.back()
    }

    /// Drop every entry last issued by `batch`, on either stack. Used when
    /// the server refuses that batch, so the edit never took.
    pub fn forget(&mut self, batch: u64) -> usize {
        let before = self.undo.len() + self.redo.len();
        self.undo.retain(|e| e.batch != batch);
        self.redo.retain(|e| e.batch != batch);
        before - self.undo.len() - self.redo.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    fn push_bounded(stack: &mut VecDeque<UndoEntry>, entry: UndoEntry, limit: Option<usize>) {
        stack.push_back(entry);
        if let Some(limit) = limit {
            while stack.len() > limit {
                if let Some(dropped) = stack.pop_front() {
                    log::debug!("history full, dropping {}", dropped.forward);
                }
            }
        }
    }
}
