//! JSON wire protocol between editor clients and the session server.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! client → server   join · operation · cursor · leave · sync_request · ping
//! server → client   initial_state · operation · user_list · peer_joined · peer_left
//!                   cursor · ack · checksum · snapshot · pong · error
//! ```
//!
//! Browser clients send text frames; binary frames carrying the same JSON
//! bytes are accepted too.

use std::collections::BTreeMap;

use codeshare_core::{Operation, OperationBatch, Position};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::PeerColor;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection.
    Join { session: String, user: String },
    /// A locally produced batch plus the snapshot it resulted in.
    /// `revision` is the last server revision the batch was written on.
    Operation {
        user: String,
        operations: Vec<Operation>,
        snapshot: String,
        revision: u64,
    },
    Cursor { user: String, position: Position },
    /// Best-effort goodbye, never acknowledged.
    Leave { user: String },
    /// Ask for the authoritative snapshot.
    SyncRequest { user: String },
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `join`: everything a late joiner needs.
    InitialState {
        snapshot: String,
        peers: Vec<String>,
        peer_colors: BTreeMap<String, PeerColor>,
        cursor_positions: BTreeMap<String, Position>,
        revision: u64,
    },
    /// A sequenced batch from another peer, with the server's resulting
    /// snapshot and revision.
    Operation {
        user: String,
        operations: Vec<Operation>,
        snapshot: String,
        revision: u64,
    },
    UserList {
        peers: Vec<String>,
        peer_colors: BTreeMap<String, PeerColor>,
    },
    PeerJoined { user: String, color: PeerColor },
    PeerLeft { user: String },
    Cursor { user: String, position: Position },
    /// Sent to the author of a batch once it has been sequenced.
    Ack { revision: u64, checksum: String },
    /// Periodic digest of the authoritative snapshot.
    Checksum { revision: u64, checksum: String },
    /// Reply to `sync_request`.
    Snapshot { snapshot: String, revision: u64 },
    Pong,
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Operation { .. } => "operation",
            Self::Cursor { .. } => "cursor",
            Self::Leave { .. } => "leave",
            Self::SyncRequest { .. } => "sync_request",
            Self::Ping => "ping",
        }
    }
}

impl From<OperationBatch> for ClientMessage {
    fn from(batch: OperationBatch) -> Self {
        Self::Operation {
            user: batch.user,
            operations: batch.operations,
            snapshot: batch.snapshot,
            revision: batch.revision,
        }
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Peer the message is about, when it originates from one.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Operation { user, .. }
            | Self::Cursor { user, .. }
            | Self::PeerJoined { user, .. }
            | Self::PeerLeft { user } => Some(user),
            Self::InitialState { .. }
            | Self::UserList { .. }
            | Self::Ack { .. }
            | Self::Checksum { .. }
            | Self::Snapshot { .. }
            | Self::Pong
            | Self::Error { .. } => None,
        }
    }

    /// Message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitialState { .. } => "initial_state",
            Self::Operation { .. } => "operation",
            Self::UserList { .. } => "user_list",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::Cursor { .. } => "cursor",
            Self::Ack { .. } => "ack",
            Self::Checksum { .. } => "checksum",
            Self::Snapshot { .. } => "snapshot",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected {0} before join")]
    NotJoined(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wire_format() {
        let msg = ClientMessage::Join {
            session: "room-1".into(),
            user: "alice".into(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"join","session":"room-1","user":"alice"}"#
        );
    }

    #[test]
    fn test_operation_from_browser_json() {
        let raw = br#"{"type":"operation","user":"bob","operations":[{"type":"delete","position":3,"length":2},{"type":"insert","position":3,"text":"p"}],"snapshot":"help","revision":9}"#;
        let msg = ClientMessage::from_json(raw).unwrap();
        match msg {
            ClientMessage::Operation {
                user,
                operations,
                snapshot,
                revision,
            } => {
                assert_eq!(user, "bob");
                assert_eq!(operations, vec![Operation::delete(3, 2), Operation::insert(3, "p")]);
                assert_eq!(snapshot, "help");
                assert_eq!(revision, 9);
            }
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[test]
    fn test_operation_without_base_revision_rejected() {
        let raw = br#"{"type":"operation","user":"bob","operations":[],"snapshot":""}"#;
        assert!(ClientMessage::from_json(raw).is_err());
    }

    #[test]
    fn test_cursor_position_shape() {
        let msg = ClientMessage::Cursor {
            user: "alice".into(),
            position: Position::new(2, 5),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""position":{"line":2,"column":5}"#));
    }

    #[test]
    fn test_ping_has_only_type() {
        assert_eq!(ClientMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_initial_state_roundtrip() {
        let mut colors = BTreeMap::new();
        colors.insert("alice".to_string(), PeerColor::rgb(0xFF, 0x57, 0x33));
        let mut cursors = BTreeMap::new();
        cursors.insert("alice".to_string(), Position::new(0, 3));

        let msg = ServerMessage::InitialState {
            snapshot: "fn main() {}".into(),
            peers: vec!["alice".into()],
            peer_colors: colors,
            cursor_positions: cursors,
            revision: 7,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r##""peer_colors":{"alice":"#FF5733"}"##));
        assert_eq!(ServerMessage::from_json(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_origin() {
        let cursor = ServerMessage::Cursor {
            user: "bob".into(),
            position: Position::ZERO,
        };
        assert_eq!(cursor.origin(), Some("bob"));
        assert_eq!(ServerMessage::Pong.origin(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::from_json(br#"{"type":"colors"}"#).is_err());
        assert!(ServerMessage::from_json(b"not json").is_err());
    }

    #[test]
    fn test_kind_names_match_wire_tag() {
        let msg = ServerMessage::Ack {
            revision: 1,
            checksum: "x".into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(&format!(r#""type":"{}""#, msg.kind())));
    }
}
