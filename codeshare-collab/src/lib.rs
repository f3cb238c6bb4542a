//! # codeshare-collab — real-time session layer for codeshare
//!
//! Keeps a shared text document and every participant's cursor in sync
//! over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer      │
//! │ (per user)  │     JSON messages   │ (sequencer)     │
//! └──────┬──────┘                     └────────┬────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌─────────────┐                     ┌─────────────────┐
//! │ Replica     │                     │ SessionDocument │
//! │ + presence  │                     │ (authority)     │
//! └──────┬──────┘                     └────────┬────────┘
//!        │                                     │
//!        ▼                             ┌───────┴────────┐
//! ┌─────────────┐                      │ BroadcastGroup │
//! │ EditorView  │                      │ (fan-out)      │
//! └─────────────┘                      └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`presence`]: peer colors, cursor markers, cursor rate limiting
//! - [`replica`]: per-client session state and the [`EditorView`] seam
//! - [`session`]: the server's authoritative document and membership
//! - [`broadcast`]: per-session fan-out and the session registry
//! - [`server`]: WebSocket session server
//! - [`client`]: WebSocket client driving a replica

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Delivery, RoomEvent, RoomManager};
pub use client::{ClientConfig, ClientError, SyncClient};
pub use presence::{CursorMarker, PeerColor, PresenceRoom, RemotePeer, PALETTE};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use replica::{ConnectionState, EditorView, HeadlessView, Reaction, Replica, ResyncReason, SyncEvent};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{JoinError, SessionDocument, SessionRoom};
