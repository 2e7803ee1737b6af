//! The seam between the synchronization engine and a live connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ProtocolError};

/// Outbound half of a connection as seen by [`SyncEngine`](crate::engine::SyncEngine).
pub trait Transport {
    /// Identifier of the live connection, `None` while disconnected.
    ///
    /// Every successful connect yields a new, larger epoch.
    fn connection_epoch(&self) -> Option<u64>;

    /// Queue a message for the live connection without blocking.
    fn send(&self, message: ClientMessage) -> Result<(), ProtocolError>;
}

/// Connection epochs shared between a connection task and its transport.
#[derive(Debug, Default)]
pub struct ConnectionEpoch {
    /// 0 while disconnected.
    current: AtomicU64,
    generation: AtomicU64,
}

impl ConnectionEpoch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a new connection live and return its epoch.
    pub fn begin(&self) -> u64 {
        let epoch = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.store(epoch, Ordering::SeqCst);
        epoch
    }

    pub fn end(&self) {
        self.current.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<u64> {
        match self.current.load(Ordering::SeqCst) {
            0 => None,
            epoch => Some(epoch),
        }
    }
}

/// [`Transport`] over an unbounded channel drained by a connection task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    epoch: Arc<ConnectionEpoch>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelTransport {
    /// A transport and the receiving end its connection task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (Self::with_epoch(ConnectionEpoch::new(), outgoing), rx)
    }

    pub fn with_epoch(
        epoch: Arc<ConnectionEpoch>,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self { epoch, outgoing }
    }

    pub fn epoch(&self) -> &Arc<ConnectionEpoch> {
        &self.epoch
    }
}

impl Transport for ChannelTransport {
    fn connection_epoch(&self) -> Option<u64> {
        self.epoch.get()
    }

    fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        self.outgoing
            .send(message)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConfirmingBatch, OriginToken};
    use uuid::Uuid;

    #[test]
    fn test_epochs_increase_across_reconnects() {
        let epoch = ConnectionEpoch::new();
        assert_eq!(epoch.get(), None);
        assert_eq!(epoch.begin(), 1);
        assert_eq!(epoch.get(), Some(1));
        epoch.end();
        assert_eq!(epoch.get(), None);
        assert_eq!(epoch.begin(), 2);
    }

    #[test]
    fn test_channel_transport_send() {
        let (transport, mut rx) = ChannelTransport::new();
        let msg = ClientMessage::BroadcastChanges(ConfirmingBatch::new(
            OriginToken::new(Uuid::new_v4(), 1),
            vec![],
        ));
        transport.send(msg.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), msg);

        drop(rx);
        assert_eq!(transport.send(msg), Err(ProtocolError::ConnectionClosed));
    }
}
