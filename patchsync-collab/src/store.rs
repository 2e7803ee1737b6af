//! The authoritative document held by the server.
//!
//! One [`Document`] behind a mutex. Accepted batches are applied and fanned
//! out while the lock is held, so every peer observes batches in exactly the
//! order they were applied, and a snapshot taken under the same lock lines
//! up with the first broadcast its subscriber will receive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use patchsync_core::{Document, PatchApplicationError};

use crate::broadcast::{BroadcastGroup, ConnectionId, Frame, PeerInfo};
use crate::protocol::{ConfirmingBatch, OriginToken, ProtocolError, Rejection, ServerMessage};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Frames buffered per connection before it lags.
    pub broadcast_capacity: usize,
    /// Refuse batches that leave the document outside the
    /// `{"nodes": {id: {name?, x?}}}` shape.
    pub enforce_shape: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            enforce_shape: true,
        }
    }
}

/// Why a submitted batch was refused. Nothing was applied or broadcast.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("batch is empty")]
    EmptyBatch,
    #[error(transparent)]
    Patch(#[from] PatchApplicationError),
    #[error("document shape violated: {0}")]
    Shape(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SubmitError {
    /// The negative acknowledgment sent back to the submitter.
    pub fn rejection(&self, origin_token: OriginToken) -> Rejection {
        let index = match self {
            Self::Patch(e) => Some(e.index),
            _ => None,
        };
        Rejection {
            origin_token,
            index,
            reason: self.to_string(),
        }
    }
}

/// Outcome of an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Document version after the batch.
    pub version: u64,
    /// Connections the batch was sent to.
    pub receivers: usize,
}

/// What a connection needs to start following the store.
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub snapshot: Document,
    pub version: u64,
    pub receiver: broadcast::Receiver<Frame>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub version: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub active_peers: usize,
    pub messages_sent: u64,
    pub lagged_peers: u64,
}

struct StoreState {
    document: Document,
    version: u64,
}

/// Single authoritative document plus its fan-out group.
pub struct AuthoritativeStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    group: BroadcastGroup,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AuthoritativeStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_document(config, Document::new())
    }

    pub fn with_document(config: StoreConfig, document: Document) -> Self {
        let group = BroadcastGroup::new(config.broadcast_capacity);
        Self {
            config,
            state: Mutex::new(StoreState {
                document,
                version: 0,
            }),
            group,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn shared(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Register a connection: snapshot and subscription are taken together.
    pub async fn connect(&self, addr: Option<SocketAddr>) -> Subscription {
        let state = self.state.lock().await;
        let peer = PeerInfo::new(addr);
        let id = peer.connection_id;
        let receiver = self.group.add_peer(peer).await;
        log::debug!("connection {id} subscribed at version {}", state.version);
        Subscription {
            id,
            snapshot: state.document.clone(),
            version: state.version,
            receiver,
        }
    }

    /// Count a connection whose receiver lagged by `missed` frames. The
    /// server closes it; the client reconnects, replays what it still holds
    /// pending, and starts over from a fresh snapshot.
    pub fn record_lag(&self, id: ConnectionId, missed: u64) {
        self.group.record_lag();
        log::warn!("connection {id} missed {missed} frame(s), closing it");
    }

    pub async fn disconnect(&self, id: &ConnectionId) {
        if self.group.remove_peer(id).await.is_some() {
            log::debug!("connection {id} unsubscribed");
        }
    }

    /// Apply `change` atomically and broadcast it unchanged to every
    /// connection, the submitter included.
    pub async fn submit(&self, change: ConfirmingBatch) -> Result<SubmitReceipt, SubmitError> {
        let result = self.try_submit(change).await;
        match &result {
            Ok(_) => self.accepted.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn try_submit(&self, change: ConfirmingBatch) -> Result<SubmitReceipt, SubmitError> {
        if change.batch.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        let token = change.origin_token;
        let len = change.batch.len();
        let frame: Frame = Arc::from(ServerMessage::encode_change(&change)?);

        let mut state = self.state.lock().await;
        if self.config.enforce_shape {
            let mut staged = state.document.clone();
            staged.apply(&change.batch)?;
            staged
                .to_model()
                .map_err(|e| SubmitError::Shape(e.to_string()))?;
            state.document = staged;
        } else {
            state.document.apply(&change.batch)?;
        }
        state.version += 1;
        let receivers = self.group.broadcast(frame);

        log::debug!(
            "applied {len} operation(s) from {token} as version {} to {receivers} connection(s)",
            state.version
        );
        log::trace!("document now {}", state.document);
        Ok(SubmitReceipt {
            version: state.version,
            receivers,
        })
    }

    pub async fn snapshot(&self) -> Document {
        self.state.lock().await.document.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn stats(&self) -> StoreStats {
        let version = self.version().await;
        let group = self.group.stats().await;
        StoreStats {
            version,
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active_peers: group.active_peers,
            messages_sent: group.messages_sent,
            lagged_peers: group.lagged_peers,
        }
    }
}
