//! WebSocket hub around the authoritative store.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► Client A (echo)
//!            ├── BroadcastChanges ──► AuthoritativeStore ── onChange ──┼──► Client B
//! Client B ──┘         │                    (Document)                 └──► Client C
//!                      └── refused ── onReject ──► submitter only
//! ```
//!
//! Every connection first receives `onInit` with the current document, then
//! every accepted batch in application order. A connection that falls too
//! far behind the broadcast is closed rather than patched up in place.

use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::store::{AuthoritativeStore, StoreConfig, Subscription};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast frames buffered per connection
    pub broadcast_capacity: usize,
    /// Refuse batches that break the `nodes` document shape
    pub enforce_shape: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7266".to_string(),
            broadcast_capacity: 256,
            enforce_shape: true,
        }
    }
}

impl ServerConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            broadcast_capacity: self.broadcast_capacity,
            enforce_shape: self.enforce_shape,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub accepted_batches: u64,
    pub rejected_batches: u64,
    pub document_version: u64,
}

/// The sync server. Cheap to clone; clones share one store.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<AuthoritativeStore>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = AuthoritativeStore::shared(config.store_config());
        Self {
            config,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the listener without accepting yet.
    pub async fn bind(&self) -> io::Result<BoundServer> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        Ok(BoundServer {
            listener,
            server: self.clone(),
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.bind().await?.serve().await
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<AuthoritativeStore>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut subscription = store.connect(Some(addr)).await;
        let id = subscription.id;
        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            &mut subscription,
            addr,
            &store,
            &stats,
        )
        .await;

        // Cleanup runs whether the pump ended cleanly or not.
        store.disconnect(&id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {id} from {addr} closed");
        result
    }

    async fn pump(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        subscription: &mut Subscription,
        addr: SocketAddr,
        store: &AuthoritativeStore,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let snapshot = std::mem::take(&mut subscription.snapshot);
        send(ws_sender, &ServerMessage::Init(snapshot)).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        match ClientMessage::decode(text.as_str()) {
                            Ok(message) => {
                                let token = message.origin_token();
                                let ClientMessage::BroadcastChanges(change) = message;
                                match store.submit(change).await {
                                    Ok(receipt) => log::debug!(
                                        "Batch {token} from {addr} applied as version {}",
                                        receipt.version
                                    ),
                                    Err(e) => {
                                        log::warn!("Rejected batch {token} from {addr}: {e}");
                                        send(ws_sender, &ServerMessage::Reject(e.rejection(token))).await?;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                // Outgoing broadcast frame
                frame = subscription.receiver.recv() => match frame {
                    Ok(frame) => {
                        ws_sender.send(Message::text(frame.to_string())).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Frames are gone, echoes possibly among them. The
                        // client must come back on a new connection.
                        store.record_lag(subscription.id, n);
                        ws_sender.send(Message::Close(None)).await?;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    /// Server statistics merged with the store's counters.
    pub async fn stats(&self) -> ServerStats {
        let store = self.store.stats().await;
        let mut stats = self.stats.read().await.clone();
        stats.accepted_batches = store.accepted;
        stats.rejected_batches = store.rejected;
        stats.document_version = store.version;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AuthoritativeStore> {
        &self.store
    }
}

/// A server whose listener is bound but not yet accepting.
pub struct BoundServer {
    listener: TcpListener,
    server: SyncServer,
}

impl BoundServer {
    /// The actual address, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &SyncServer {
        &self.server
    }

    pub fn store(&self) -> &Arc<AuthoritativeStore> {
        self.server.store()
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.server.store.clone();
            let stats = self.server.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = SyncServer::handle_connection(stream, addr, store, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn send(ws_sender: &mut WsSender, message: &ServerMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::text(message.encode()?)).await?;
    Ok(())
}
