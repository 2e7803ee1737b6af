//! WebSocket connection for a synchronizing client.
//!
//! Provides:
//! - Connection lifecycle (connect, manual start/stop, automatic reconnect)
//! - Decoding of server frames into [`SyncEvent`]s for the engine
//! - A [`Transport`](crate::transport::Transport) the engine sends through
//!
//! The connection runs in its own task. The application owns the
//! [`SyncEngine`](crate::engine::SyncEngine) and feeds it events from the
//! receiver returned by [`SyncClient::spawn`], one at a time.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::transport::{ChannelTransport, ConnectionEpoch};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The transport handed to the engine.
pub type WsTransport = ChannelTransport;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A connection opened by `start` (or the initial connect) is live.
    Connected,
    /// The connection came back after an unexpected loss.
    Reconnected,
    /// The connection is gone; sends are held back until the next one.
    Disconnected,
    Message(ServerMessage),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Wait before each automatic reconnect attempt; the client gives up
    /// once the schedule is exhausted.
    pub reconnect_delays: Vec<Duration>,
    /// Events buffered for the application.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:7266".to_string(),
            reconnect_delays: [0, 2, 10, 30].into_iter().map(Duration::from_secs).collect(),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Shutdown,
}

/// Controls a running connection task. The task shuts down once every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    epoch: Arc<ConnectionEpoch>,
}

impl ClientHandle {
    /// Connect if not already connected.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Close the connection and stay offline until `start`.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn is_connected(&self) -> bool {
        self.epoch.get().is_some()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("connection task already finished, {command:?} ignored");
        }
    }
}

/// The sync client.
///
/// Owns the channels between the application and the connection task until
/// [`start`](Self::start) moves them into the task.
pub struct SyncClient {
    config: ClientConfig,
    epoch: Arc<ConnectionEpoch>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::UnboundedSender<ClientMessage>,
    outgoing_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client and the receiver its events arrive on.
    pub fn new(config: ClientConfig) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let client = Self {
            config,
            epoch: ConnectionEpoch::new(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx,
            outgoing_rx,
            event_tx,
        };
        (client, event_rx)
    }

    /// Create, start, and split a client in one step.
    pub fn spawn(config: ClientConfig) -> (WsTransport, mpsc::Receiver<SyncEvent>, ClientHandle) {
        let (client, events) = Self::new(config);
        let transport = client.transport();
        let handle = client.start();
        (transport, events, handle)
    }

    pub fn transport(&self) -> WsTransport {
        ChannelTransport::with_epoch(self.epoch.clone(), self.outgoing_tx.clone())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawn the connection task and begin connecting.
    pub fn start(self) -> ClientHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            commands: commands_tx,
            state: self.state.clone(),
            epoch: self.epoch.clone(),
        };
        let task = ConnectionTask {
            config: self.config,
            epoch: self.epoch,
            state: self.state,
            outgoing: self.outgoing_rx,
            _outgoing_keepalive: self.outgoing_tx,
            events: self.event_tx,
            commands,
        };
        tokio::spawn(task.run());
        handle
    }
}

/// How a connection (or attempt) ended.
enum Exit {
    /// Dropped without being asked to: reconnect automatically.
    Lost,
    /// Offline until the next `start`.
    Idle,
    Shutdown,
}

struct ConnectionTask {
    config: ClientConfig,
    epoch: Arc<ConnectionEpoch>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    // Keeps `outgoing` open when every transport has been dropped.
    _outgoing_keepalive: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::Sender<SyncEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut exit = self.connect().await;
        loop {
            exit = match exit {
                Exit::Lost => self.reconnect().await,
                Exit::Idle => self.idle().await,
                Exit::Shutdown => break,
            };
        }
        self.set_state(ConnectionState::Disconnected).await;
        log::debug!("connection task for {} finished", self.config.server_url);
    }

    /// Wait offline for a command.
    async fn idle(&mut self) -> Exit {
        loop {
            match self.commands.recv().await {
                Some(Command::Start) => return self.connect().await,
                Some(Command::Stop) => {}
                Some(Command::Shutdown) | None => return Exit::Shutdown,
            }
        }
    }

    /// A single manual connection attempt.
    async fn connect(&mut self) -> Exit {
        self.set_state(ConnectionState::Connecting).await;
        match self.open().await {
            Ok(ws) => self.session(ws, SyncEvent::Connected).await,
            Err(e) => {
                log::error!("Failed to connect to {}: {e}", self.config.server_url);
                self.set_state(ConnectionState::Disconnected).await;
                Exit::Idle
            }
        }
    }

    /// Follow the reconnect schedule after a lost connection.
    async fn reconnect(&mut self) -> Exit {
        self.set_state(ConnectionState::Reconnecting).await;
        let delays = self.config.reconnect_delays.clone();
        for (attempt, delay) in delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    command = self.commands.recv() => match command {
                        Some(Command::Stop) => {
                            self.set_state(ConnectionState::Disconnected).await;
                            return Exit::Idle;
                        }
                        Some(Command::Start) => {}
                        Some(Command::Shutdown) | None => return Exit::Shutdown,
                    }
                }
            }
            match self.open().await {
                Ok(ws) => return self.session(ws, SyncEvent::Reconnected).await,
                Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
        }
        log::error!(
            "Giving up on {} after {} reconnect attempts",
            self.config.server_url,
            delays.len()
        );
        self.set_state(ConnectionState::Disconnected).await;
        Exit::Idle
    }

    async fn open(&self) -> Result<WsStream, ProtocolError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.server_url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        Ok(ws)
    }

    /// Pump one live connection until it ends.
    async fn session(&mut self, ws: WsStream, opened: SyncEvent) -> Exit {
        // Anything still queued was meant for a previous connection.
        self.discard_outgoing();
        let epoch = self.epoch.begin();
        self.set_state(ConnectionState::Connected).await;
        log::info!("Connected to {} (epoch {epoch})", self.config.server_url);

        let (mut writer, mut reader) = ws.split();
        let mut exit = if self.events.send(opened).await.is_err() {
            Some(Exit::Shutdown)
        } else {
            None
        };

        while exit.is_none() {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                        Ok(msg) => {
                            log::trace!("received {}", msg.event_name());
                            if self.events.send(SyncEvent::Message(msg)).await.is_err() {
                                exit = Some(Exit::Shutdown);
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed frame: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if writer.send(Message::Pong(data)).await.is_err() {
                            exit = Some(Exit::Lost);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection to {} closed", self.config.server_url);
                        exit = Some(Exit::Lost);
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        exit = Some(Exit::Lost);
                    }
                    Some(Ok(_)) => {}
                },

                message = self.outgoing.recv() => {
                    if let Some(message) = message {
                        match message.encode() {
                            Ok(text) => {
                                if let Err(e) = writer.send(Message::text(text)).await {
                                    log::warn!("Send failed: {e}");
                                    exit = Some(Exit::Lost);
                                }
                            }
                            Err(e) => log::error!("Dropping unencodable message: {e}"),
                        }
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Stop) => exit = Some(Exit::Idle),
                    Some(Command::Start) => {}
                    Some(Command::Shutdown) | None => exit = Some(Exit::Shutdown),
                },
            }
        }

        self.epoch.end();
        let exit = exit.unwrap_or(Exit::Lost);
        if !matches!(exit, Exit::Lost) {
            let _ = writer.send(Message::Close(None)).await;
            self.set_state(ConnectionState::Disconnected).await;
        }
        self.discard_outgoing();
        let _ = self.events.send(SyncEvent::Disconnected).await;
        exit
    }

    fn discard_outgoing(&mut self) {
        let mut dropped = 0usize;
        while self.outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("discarded {dropped} message(s) queued for a dead connection");
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::time::timeout;

    /// A port nothing listens on.
    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:7266");
        assert_eq!(
            config.reconnect_delays,
            vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30)
            ]
        );
        assert_eq!(config.event_capacity, 256);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let (client, _events) = SyncClient::new(ClientConfig::new("ws://127.0.0.1:1"));
        let transport = client.transport();
        assert_eq!(transport.connection_epoch(), None);
        assert_eq!(*client.state.read().await, ConnectionState::Disconnected);
        assert_eq!(client.config().server_url, "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_failed_connect_goes_idle() {
        let (transport, mut events, handle) = SyncClient::spawn(ClientConfig::new(dead_url().await));

        // No event is emitted for a connection that never opened.
        assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());
        assert_eq!(handle.state().await, ConnectionState::Disconnected);
        assert!(!handle.is_connected());
        assert_eq!(transport.connection_epoch(), None);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_transport_queues_while_offline() {
        let (client, _events) = SyncClient::new(ClientConfig::default());
        let transport = client.transport();
        // Sending never blocks; the connection task decides what goes out.
        let msg = ClientMessage::BroadcastChanges(crate::protocol::ConfirmingBatch::new(
            crate::protocol::OriginToken::new(uuid::Uuid::new_v4(), 1),
            vec![],
        ));
        assert!(transport.send(msg).is_ok());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}
