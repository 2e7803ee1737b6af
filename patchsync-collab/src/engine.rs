//! Client-side optimistic synchronization.
//!
//! The engine keeps two replicas:
//!
//! ```text
//! confirmed: every batch the server has broadcast, in broadcast order
//! local    : confirmed + every pending batch, in submission order
//! ```
//!
//! Local edits land on `local` immediately and wait in the [`PendingTable`]
//! until their own broadcast comes back. Foreign batches land on `confirmed`
//! and `local` is rebuilt on top of it, so the user never sees their own
//! speculative edits vanish while the authoritative order still wins once
//! everything is confirmed.
//!
//! The engine is synchronous: it is owned by one task and fed one
//! [`SyncEvent`] at a time.

use std::collections::BTreeMap;

use patchsync_core::{Document, History, PatchApplicationError, PatchOp, UndoEntry};
use uuid::Uuid;

use crate::client::SyncEvent;
use crate::protocol::{ClientMessage, ConfirmingBatch, OriginToken, Rejection, ServerMessage};
use crate::transport::Transport;

/// A batch submitted locally and not yet seen in a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub token: OriginToken,
    pub batch: Vec<PatchOp>,
    /// Connection epoch the batch was last handed to the transport on.
    pub sent_epoch: Option<u64>,
}

/// Unconfirmed batches in submission order.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    // Tokens from one client share `client_id`, so key order is `seq` order.
    entries: BTreeMap<OriginToken, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: OriginToken, batch: Vec<PatchOp>) {
        self.entries.insert(
            token,
            PendingEntry {
                token,
                batch,
                sent_epoch: None,
            },
        );
    }

    pub fn remove(&mut self, token: &OriginToken) -> Option<PendingEntry> {
        self.entries.remove(token)
    }

    pub fn get(&self, token: &OriginToken) -> Option<&PendingEntry> {
        self.entries.get(token)
    }

    fn get_mut(&mut self, token: &OriginToken) -> Option<&mut PendingEntry> {
        self.entries.get_mut(token)
    }

    pub fn contains(&self, token: &OriginToken) -> bool {
        self.entries.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    pub fn tokens(&self) -> Vec<OriginToken> {
        self.entries.keys().copied().collect()
    }
}

/// What an inbound event did to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    /// Our own batch came back; it is now part of the confirmed document.
    Confirmed(OriginToken),
    /// Another client's batch was applied. `dropped` lists pending batches
    /// that no longer apply on top of it.
    RemoteApplied {
        token: OriginToken,
        dropped: Vec<OriginToken>,
    },
    /// The document was replaced by a server snapshot.
    SnapshotLoaded {
        replayed: usize,
        dropped: Vec<OriginToken>,
    },
    /// Pending batches were resent after a (re)connect.
    Replayed(usize),
    /// The server refused one of our batches and it was rolled back.
    RolledBack {
        token: OriginToken,
        dropped: Vec<OriginToken>,
    },
    Disconnected,
    Unchanged,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("batch is empty")]
    EmptyBatch,
    #[error("local edit refused: {0}")]
    LocalApply(#[from] PatchApplicationError),
    #[error("broadcast {token} does not apply to the confirmed document: {source}")]
    RemoteApply {
        token: OriginToken,
        source: PatchApplicationError,
    },
}

/// Optimistic replica plus the bookkeeping to converge with the server.
pub struct SyncEngine<T: Transport> {
    client_id: Uuid,
    next_seq: u64,
    local: Document,
    confirmed: Document,
    pending: PendingTable,
    history: History,
    transport: T,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_client_id(Uuid::new_v4(), transport)
    }

    pub fn with_client_id(client_id: Uuid, transport: T) -> Self {
        Self {
            client_id,
            next_seq: 0,
            local: Document::new(),
            confirmed: Document::new(),
            pending: PendingTable::new(),
            history: History::new(),
            transport,
        }
    }

    /// Start both replicas from `document` instead of an empty project.
    pub fn seed(&mut self, document: Document) {
        self.local = document.clone();
        self.confirmed = document;
    }

    /// Bound the undo and redo stacks.
    pub fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    // ── Local edits ──────────────────────────────────────────────────────

    /// Apply `op` locally, record its undo entry, and submit it.
    pub fn perform_local_edit(&mut self, op: PatchOp) -> Result<OriginToken, SyncError> {
        self.perform_local_batch(vec![op])
    }

    /// Apply `batch` locally as one unit and submit it under one token.
    ///
    /// Each operation gets its own undo entry, tagged with the batch's
    /// sequence number. Nothing is recorded or sent when any operation fails.
    pub fn perform_local_batch(&mut self, batch: Vec<PatchOp>) -> Result<OriginToken, SyncError> {
        if batch.is_empty() {
            return Err(SyncError::EmptyBatch);
        }
        let mut staged = self.local.clone();
        let mut entries = Vec::with_capacity(batch.len());
        for (index, op) in batch.iter().enumerate() {
            let fail = |source| PatchApplicationError::new(index, op.clone(), source);
            entries.push(UndoEntry::new(op.clone(), &staged, 0).map_err(fail)?);
            staged.apply_op(op).map_err(fail)?;
        }

        self.local = staged;
        let token = self.enqueue(batch);
        for mut entry in entries {
            entry.batch = token.seq;
            self.history.push_edit(entry);
        }
        Ok(token)
    }

    /// Apply and submit without touching the undo history.
    pub fn submit_local(&mut self, batch: Vec<PatchOp>) -> Result<OriginToken, SyncError> {
        if batch.is_empty() {
            return Err(SyncError::EmptyBatch);
        }
        self.local.apply(&batch)?;
        Ok(self.enqueue(batch))
    }

    /// Revert the most recent edit. `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self) -> Result<Option<OriginToken>, SyncError> {
        let Some(mut entry) = self.history.pop_undo() else {
            return Ok(None);
        };
        match self.submit_local(vec![entry.inverse.clone()]) {
            Ok(token) => {
                entry.batch = token.seq;
                self.history.push_redo(entry);
                Ok(Some(token))
            }
            Err(e) => {
                self.history.push_undo(entry);
                Err(e)
            }
        }
    }

    /// Reapply the most recently undone edit.
    pub fn redo(&mut self) -> Result<Option<OriginToken>, SyncError> {
        let Some(mut entry) = self.history.pop_redo() else {
            return Ok(None);
        };
        match self.submit_local(vec![entry.forward.clone()]) {
            Ok(token) => {
                entry.batch = token.seq;
                self.history.push_undo(entry);
                Ok(Some(token))
            }
            Err(e) => {
                self.history.push_redo(entry);
                Err(e)
            }
        }
    }

    fn enqueue(&mut self, batch: Vec<PatchOp>) -> OriginToken {
        self.next_seq += 1;
        let token = OriginToken::new(self.client_id, self.next_seq);
        self.pending.insert(token, batch);
        if !self.send_entry(&token) {
            log::debug!("batch {token} queued until the next connection");
        }
        token
    }

    /// Hand a pending entry to the transport unless it already went out on
    /// the current connection.
    fn send_entry(&mut self, token: &OriginToken) -> bool {
        let Some(epoch) = self.transport.connection_epoch() else {
            return false;
        };
        let Some(entry) = self.pending.get_mut(token) else {
            return false;
        };
        if entry.sent_epoch == Some(epoch) {
            return false;
        }
        let message =
            ClientMessage::BroadcastChanges(ConfirmingBatch::new(*token, entry.batch.clone()));
        match self.transport.send(message) {
            Ok(()) => {
                entry.sent_epoch = Some(epoch);
                true
            }
            Err(e) => {
                log::debug!("batch {token} not sent ({e}), keeping it pending");
                false
            }
        }
    }

    /// Resend every pending entry in submission order.
    fn replay(&mut self) -> usize {
        let mut sent = 0;
        for token in self.pending.tokens() {
            if self.send_entry(&token) {
                sent += 1;
            }
        }
        sent
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Dispatch one event from the connection.
    pub fn handle_event(&mut self, event: SyncEvent) -> Result<EngineUpdate, SyncError> {
        match event {
            SyncEvent::Connected | SyncEvent::Reconnected => {
                Ok(EngineUpdate::Replayed(self.on_reconnected()))
            }
            SyncEvent::Disconnected => Ok(EngineUpdate::Disconnected),
            SyncEvent::Message(ServerMessage::Init(document)) => {
                Ok(self.on_full_snapshot(document))
            }
            SyncEvent::Message(ServerMessage::Change(change)) => {
                self.on_broadcast_received(change)
            }
            SyncEvent::Message(ServerMessage::Reject(rejection)) => {
                Ok(self.on_rejected(rejection))
            }
        }
    }

    /// Reconcile one broadcast batch.
    pub fn on_broadcast_received(
        &mut self,
        change: ConfirmingBatch,
    ) -> Result<EngineUpdate, SyncError> {
        let token = change.origin_token;
        self.confirmed
            .apply(&change.batch)
            .map_err(|source| SyncError::RemoteApply { token, source })?;

        if self.pending.remove(&token).is_some() {
            // Already on `local`.
            log::debug!("batch {token} confirmed, {} still pending", self.pending.len());
            return Ok(EngineUpdate::Confirmed(token));
        }

        let dropped = if self.pending.is_empty() {
            if let Err(e) = self.local.apply(&change.batch) {
                log::warn!("local replica diverged ({e}), resetting to confirmed");
                self.local = self.confirmed.clone();
            }
            Vec::new()
        } else {
            // The server applies our batches after this one, so they fail there too.
            let dropped = self.rebase();
            self.forget_all(&dropped);
            dropped
        };
        log::debug!("applied remote batch {token}");
        Ok(EngineUpdate::RemoteApplied { token, dropped })
    }

    /// Replace both replicas with a server snapshot and resend pending work.
    ///
    /// A pending batch that no longer applies may already be part of the
    /// snapshot (its echo was lost with the previous connection), so its
    /// undo entries are kept.
    pub fn on_full_snapshot(&mut self, document: Document) -> EngineUpdate {
        self.confirmed = document;
        let dropped = self.rebase();
        let replayed = self.replay();
        log::info!(
            "loaded snapshot with {} node(s), replayed {replayed} pending batch(es)",
            self.confirmed.node_count()
        );
        EngineUpdate::SnapshotLoaded { replayed, dropped }
    }

    /// Resend pending batches after the connection came back.
    pub fn on_reconnected(&mut self) -> usize {
        let replayed = self.replay();
        if replayed > 0 {
            log::info!("replayed {replayed} pending batch(es)");
        }
        replayed
    }

    /// Roll back a batch the server refused.
    pub fn on_rejected(&mut self, rejection: Rejection) -> EngineUpdate {
        let token = rejection.origin_token;
        if self.pending.remove(&token).is_none() {
            log::debug!("ignoring rejection of unknown batch {token}");
            return EngineUpdate::Unchanged;
        }
        log::warn!("server rejected batch {token}: {}", rejection.reason);
        self.history.forget(token.seq);
        let dropped = self.rebase();
        self.forget_all(&dropped);
        EngineUpdate::RolledBack { token, dropped }
    }

    /// Rebuild `local` as `confirmed` plus every pending batch. Pending
    /// batches that no longer apply are discarded and returned.
    fn rebase(&mut self) -> Vec<OriginToken> {
        let mut local = self.confirmed.clone();
        let mut dropped = Vec::new();
        for entry in self.pending.iter() {
            if let Err(e) = local.apply(&entry.batch) {
                log::warn!("dropping pending batch {}: {e}", entry.token);
                dropped.push(entry.token);
            }
        }
        for token in &dropped {
            self.pending.remove(token);
        }
        self.local = local;
        dropped
    }

    fn forget_all(&mut self, tokens: &[OriginToken]) {
        for token in tokens {
            self.history.forget(token.seq);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// The optimistic local replica.
    pub fn document(&self) -> &Document {
        &self.local
    }

    pub fn confirmed(&self) -> &Document {
        &self.confirmed
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.connection_epoch().is_some()
    }

    /// No pending work and the local replica matches the server.
    pub fn is_synced(&self) -> bool {
        self.pending.is_empty() && self.local == self.confirmed
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }
}
