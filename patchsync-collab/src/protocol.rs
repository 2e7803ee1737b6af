//! JSON text protocol for patch synchronization.
//!
//! Every WebSocket text frame carries exactly one named event:
//!
//! ```text
//! {"event":"BroadcastChanges","payload":{"originToken":{…},"batch":[…]}}   client → server
//! {"event":"onInit","payload":{"nodes":{…}}}                               server → client
//! {"event":"onChange","payload":{"originToken":{…},"batch":[…]}}           server → all
//! {"event":"onReject","payload":{"originToken":{…},"index":0,"reason":"…"}} server → sender
//! ```
//!
//! The server never interprets an [`OriginToken`]; it relays it verbatim so
//! the submitting client can recognise its own echo.

use std::fmt;

use patchsync_core::{Document, PatchOp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation tag minted by a client for each submitted batch.
///
/// A random per-client identity plus a per-client counter, so two clients
/// can never mint the same token and a client never reuses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginToken {
    pub client_id: Uuid,
    pub seq: u64,
}

impl OriginToken {
    pub fn new(client_id: Uuid, seq: u64) -> Self {
        Self { client_id, seq }
    }
}

impl fmt::Display for OriginToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client_id, self.seq)
    }
}

/// A batch of operations tagged with the token of the client that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmingBatch {
    pub origin_token: OriginToken,
    pub batch: Vec<PatchOp>,
}

impl ConfirmingBatch {
    pub fn new(origin_token: OriginToken, batch: Vec<PatchOp>) -> Self {
        Self { origin_token, batch }
    }
}

/// Negative acknowledgment for a batch the server refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub origin_token: OriginToken,
    /// Index of the failing operation, when a single one is to blame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub reason: String,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientMessage {
    BroadcastChanges(ConfirmingBatch),
}

impl ClientMessage {
    pub fn origin_token(&self) -> OriginToken {
        match self {
            Self::BroadcastChanges(change) => change.origin_token,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    /// Full snapshot, sent first on every connection.
    #[serde(rename = "onInit")]
    Init(Document),
    /// An accepted batch, fanned out to every connection including its sender.
    #[serde(rename = "onChange")]
    Change(ConfirmingBatch),
    /// A refused batch, sent to its submitter only.
    #[serde(rename = "onReject")]
    Reject(Rejection),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode an `onChange` frame without taking ownership of the batch.
    pub fn encode_change(change: &ConfirmingBatch) -> Result<String, ProtocolError> {
        serde_json::to_string(&ServerMessageRef::Change(change))
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Init(_) => "onInit",
            Self::Change(_) => "onChange",
            Self::Reject(_) => "onReject",
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "event", content = "payload")]
enum ServerMessageRef<'a> {
    #[serde(rename = "onChange")]
    Change(&'a ConfirmingBatch),
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> OriginToken {
        OriginToken::new(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(), 7)
    }

    #[test]
    fn test_broadcast_changes_wire_shape() {
        let msg = ClientMessage::BroadcastChanges(ConfirmingBatch::new(
            token(),
            vec![PatchOp::add("/nodes/42", json!({"x": 1, "name": "bla"}))],
        ));
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "BroadcastChanges",
                "payload": {
                    "originToken": {"clientId": "550e8400-e29b-41d4-a716-446655440000", "seq": 7},
                    "batch": [{"kind": "add", "path": "/nodes/42", "value": {"x": 1, "name": "bla"}}]
                }
            })
        );
        assert_eq!(msg.origin_token(), token());
    }

    #[test]
    fn test_server_event_names() {
        let init = ServerMessage::Init(Document::new());
        let value: serde_json::Value = serde_json::from_str(&init.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "onInit", "payload": {"nodes": {}}}));

        let change = ServerMessage::Change(ConfirmingBatch::new(token(), vec![]));
        assert!(change.encode().unwrap().contains("\"onChange\""));
        assert_eq!(change.event_name(), "onChange");

        let ServerMessage::Change(inner) = &change else { unreachable!() };
        assert_eq!(ServerMessage::encode_change(inner).unwrap(), change.encode().unwrap());
    }

    #[test]
    fn test_reject_omits_missing_index() {
        let reject = ServerMessage::Reject(Rejection {
            origin_token: token(),
            index: None,
            reason: "empty batch".into(),
        });
        let text = reject.encode().unwrap();
        assert!(!text.contains("index"));
        assert_eq!(ServerMessage::decode(&text).unwrap(), reject);
    }

    #[test]
    fn test_decode_from_hand_written_frame() {
        let text = r#"{"event":"onChange","payload":{"originToken":{"clientId":"550e8400-e29b-41d4-a716-446655440000","seq":7},"batch":[{"kind":"remove","path":"/nodes/42"}]}}"#;
        match ServerMessage::decode(text).unwrap() {
            ServerMessage::Change(change) => {
                assert_eq!(change.origin_token, token());
                assert_eq!(change.batch, vec![PatchOp::remove("/nodes/42")]);
            }
            other => panic!("expected onChange, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ClientMessage::decode("{\"event\":\"Nope\"}"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ServerMessage::decode("not json").is_err());
    }

    #[test]
    fn test_token_ordering_follows_seq() {
        let client_id = Uuid::new_v4();
        let first = OriginToken::new(client_id, 1);
        let second = OriginToken::new(client_id, 2);
        assert!(first < second);
        assert_ne!(OriginToken::new(Uuid::new_v4(), 1), first);
        assert_eq!(first.to_string(), format!("{client_id}#1"));
    }
}
