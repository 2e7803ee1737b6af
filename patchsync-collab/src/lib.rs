//! # patchsync-collab: optimistic patch synchronization over WebSocket
//!
//! Clients apply their own edits immediately and converge on the order in
//! which the server applied everyone's batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌────────────────────┐
//! │ SyncEngine  │ ◄────────────────► │ SyncServer         │
//! │ (per user)  │     JSON events    │ (central)          │
//! └──────┬──────┘                    └─────────┬──────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌─────────────┐                    ┌────────────────────┐
//! │ local       │                    │ AuthoritativeStore │
//! │ confirmed   │                    │ (Document)         │
//! │ pending     │                    └─────────┬──────────┘
//! │ history     │                              │
//! └─────────────┘                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │ (fan-out)     │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events and origin tokens
//! - [`broadcast`]: fan-out of pre-encoded frames with lag detection
//! - [`store`]: the authoritative document
//! - [`server`]: WebSocket hub
//! - [`transport`]: the engine's outbound seam
//! - [`engine`]: pending table, echo reconciliation, replay, undo/redo
//! - [`client`]: WebSocket connection with automatic reconnect

pub mod protocol;
pub mod broadcast;
pub mod store;
pub mod server;
pub mod transport;
pub mod engine;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientMessage, ConfirmingBatch, OriginToken, ProtocolError, Rejection, ServerMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, PeerInfo};
pub use store::{AuthoritativeStore, StoreConfig, StoreStats, SubmitError, SubmitReceipt, Subscription};
pub use server::{BoundServer, ServerConfig, ServerStats, SyncServer};
pub use transport::{ChannelTransport, ConnectionEpoch, Transport};
pub use engine::{EngineUpdate, PendingEntry, PendingTable, SyncEngine, SyncError};
pub use client::{ClientConfig, ClientHandle, ConnectionState, SyncClient, SyncEvent, WsTransport};
