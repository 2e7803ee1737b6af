//! Fan-out of accepted batches to every connected peer.
//!
//! Uses one tokio broadcast channel of pre-encoded frames: the batch is
//! serialized once and every receiver gets the same `Arc<str>`. Each
//! receiver buffers up to `capacity` frames; a peer that falls further
//! behind observes `RecvError::Lagged` and has to reconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Identity of one server-side connection.
pub type ConnectionId = Uuid;

/// A pre-encoded text frame shared by every receiver.
pub type Frame = Arc<str>;

/// A connected peer as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub addr: Option<SocketAddr>,
    pub connected_at: SystemTime,
}

impl PeerInfo {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            addr,
            connected_at: SystemTime::now(),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub lagged_peers: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    lagged_peers: AtomicU64,
}

/// One broadcast channel plus the registry of peers subscribed to it.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: Arc<RwLock<HashMap<ConnectionId, PeerInfo>>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before it
    /// starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, id: &ConnectionId) -> Option<PeerInfo> {
        self.peers.write().await.remove(id)
    }

    /// Send an encoded frame to every receiver, the submitter included.
    ///
    /// Returns the number of receivers that got the frame.
    pub fn broadcast(&self, frame: Frame) -> usize {
        // No receivers is not an error: the store may be idle.
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count a receiver that fell behind and had frames overwritten.
    pub fn record_lag(&self) {
        self.atomic_stats.lagged_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            lagged_peers: self.atomic_stats.lagged_peers.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConfirmingBatch, OriginToken, ServerMessage};
    use patchsync_core::PatchOp;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    fn change() -> ConfirmingBatch {
        ConfirmingBatch::new(
            OriginToken::new(Uuid::new_v4(), 1),
            vec![PatchOp::add("/nodes/1", json!({"x": 1}))],
        )
    }

    fn frame(change: &ConfirmingBatch) -> Frame {
        Arc::from(ServerMessage::encode_change(change).unwrap())
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new(None);
        let id = peer.connection_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.stats().await.active_peers, 1);

        assert_eq!(group.remove_peer(&id).await.unwrap().connection_id, id);
        assert_eq!(group.stats().await.active_peers, 0);
        assert!(group.remove_peer(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_includes_everyone() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_peer(PeerInfo::new(None)).await;
        let mut rx2 = group.add_peer(PeerInfo::new(None)).await;
        let mut rx3 = group.add_peer(PeerInfo::new(None)).await;

        let change = change();
        assert_eq!(group.broadcast(frame(&change)), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let received = rx.recv().await.unwrap();
            assert_eq!(
                ServerMessage::decode(&received).unwrap(),
                ServerMessage::Change(change.clone())
            );
        }
    }

    #[tokio::test]
    async fn test_frames_are_shared() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_peer(PeerInfo::new(None)).await;
        let mut rx2 = group.add_peer(PeerInfo::new(None)).await;

        group.broadcast(Arc::from("{}"));
        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(frame(&change())), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(PeerInfo::new(None)).await;
        for _ in 0..5 {
            group.broadcast(frame(&change()));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        group.record_lag();
        assert_eq!(group.stats().await.lagged_peers, 1);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(PeerInfo::new(None)).await;
        group.broadcast(frame(&change()));
        group.broadcast(frame(&change()));

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
    }
}
