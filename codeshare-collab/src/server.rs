//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRoom (name) ── Mutex<SessionDocument> ── BroadcastGroup
//! Client B ──┘                               │ apply in arrival order   │
//!                                            │ revision += 1            │
//!                              ┌─────────────┼──────────────────────────┤
//!                              ▼             ▼                          ▼
//!                    operation → others   ack → author      checksum heartbeat
//! ```
//!
//! One task per connection. The first message must be `join`; from then on
//! the task forwards its share of the room's broadcast events to the socket
//! and feeds incoming messages into the session document.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 9 (total order broadcast)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{ConnectionId, Delivery, RoomEvent, RoomManager};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{JoinError, SessionRoom};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per session
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Interval between checksum heartbeats
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub applied_batches: u64,
    pub resyncs_served: u64,
    pub rejected_joins: u64,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: RwLock<ServerStats>,
}

/// The session server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut connection = Connection {
        id: Uuid::new_v4(),
        addr,
        shared,
        membership: None,
    };
    log::info!("WebSocket connection {} established from {addr}", connection.id);

    {
        let mut s = connection.shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let outcome = connection.run(&mut ws_sender, &mut ws_receiver).await;
    connection.leave_session().await;

    {
        let mut s = connection.shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    // Best effort, the peer may already be gone.
    let _ = ws_sender.close().await;
    outcome
}

/// A joined connection's place in a session.
struct Membership {
    room: Arc<SessionRoom>,
    session: String,
    user: String,
    events: broadcast::Receiver<Arc<RoomEvent>>,
}

enum Flow {
    Continue,
    Leave,
}

struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    shared: Arc<Shared>,
    membership: Option<Membership>,
}

impl Connection {
    async fn run(&mut self, ws_sender: &mut WsSender, ws_receiver: &mut WsReceiver) -> Result<(), ServerError> {
        let period = self.shared.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let decoded = match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.count_frame(text.len()).await;
                            ClientMessage::from_json(text.as_bytes())
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.count_frame(data.len()).await;
                            ClientMessage::from_json(&data)
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed from {}", self.id, self.addr);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                    };

                    match decoded {
                        Ok(message) => {
                            if let Flow::Leave = self.handle_message(message, ws_sender).await? {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode message from {}: {e}", self.addr),
                    }
                }

                event = next_event(&mut self.membership) => {
                    match event {
                        Ok(event) => {
                            if event.is_for(self.id) {
                                log::trace!("forwarding {} to {}", event.kind, self.id);
                                ws_sender.send(Message::Text(event.payload.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => self.recover_from_lag(skipped).await?,
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick(), if self.membership.is_some() => {
                    self.send_heartbeat().await?;
                }
            }
        }

        Ok(())
    }

    async fn count_frame(&self, len: usize) {
        let mut s = self.shared.stats.write().await;
        s.total_messages += 1;
        s.total_bytes += len as u64;
    }

    async fn handle_message(&mut self, message: ClientMessage, ws_sender: &mut WsSender) -> Result<Flow, ServerError> {
        log::debug!("{} from connection {}", message.kind(), self.id);

        let Some(membership) = &self.membership else {
            return match message {
                ClientMessage::Join { session, user } => self.join(session, user, ws_sender).await,
                ClientMessage::Ping => {
                    reply(ws_sender, &ServerMessage::Pong).await?;
                    Ok(Flow::Continue)
                }
                ClientMessage::Leave { .. } => Ok(Flow::Leave),
                other => {
                    let error = ProtocolError::NotJoined(other.kind());
                    reply(ws_sender, &ServerMessage::Error { message: error.to_string() }).await?;
                    Ok(Flow::Continue)
                }
            };
        };

        let room = &membership.room;
        match message {
            ClientMessage::Join { .. } => {
                let message = format!("already joined session {}", membership.session);
                reply(ws_sender, &ServerMessage::Error { message }).await?;
            }

            ClientMessage::Operation {
                user,
                operations,
                snapshot,
                revision,
            } => {
                if user != membership.user {
                    log::debug!("batch labelled {user} on connection of {}", membership.user);
                }
                let mut document = room.document().await;
                let sequenced = document.apply(&membership.user, revision, &operations, &snapshot);
                if sequenced.clamped {
                    log::warn!(
                        "session {}: batch from {} clamped at revision {}",
                        membership.session,
                        membership.user,
                        sequenced.revision
                    );
                }
                room.group().send(
                    Delivery::Others(self.id),
                    &ServerMessage::Operation {
                        user: membership.user.clone(),
                        operations: sequenced.operations,
                        snapshot: sequenced.snapshot,
                        revision: sequenced.revision,
                    },
                )?;
                room.group().send(
                    Delivery::Only(self.id),
                    &ServerMessage::Ack {
                        revision: sequenced.revision,
                        checksum: sequenced.checksum,
                    },
                )?;
                drop(document);
                self.shared.stats.write().await.applied_batches += 1;
            }

            ClientMessage::Cursor { position, .. } => {
                let mut document = room.document().await;
                document.set_cursor(&membership.user, position);
                room.group().send(
                    Delivery::Others(self.id),
                    &ServerMessage::Cursor {
                        user: membership.user.clone(),
                        position,
                    },
                )?;
            }

            ClientMessage::SyncRequest { .. } => {
                let document = room.document().await;
                room.group().send(Delivery::Only(self.id), &document.snapshot_message())?;
                drop(document);
                log::info!("served snapshot to {} in session {}", membership.user, membership.session);
                self.shared.stats.write().await.resyncs_served += 1;
            }

            ClientMessage::Leave { .. } => return Ok(Flow::Leave),

            ClientMessage::Ping => reply(ws_sender, &ServerMessage::Pong).await?,
        }

        Ok(Flow::Continue)
    }

    async fn join(&mut self, session: String, user: String, ws_sender: &mut WsSender) -> Result<Flow, ServerError> {
        if session.is_empty() || user.is_empty() {
            let message = JoinError::EmptyIdentity.to_string();
            reply(ws_sender, &ServerMessage::Error { message }).await?;
            return Ok(Flow::Continue);
        }

        let max_peers = self.shared.config.max_peers_per_room;
        let (room, color, events, initial) = loop {
            let room = self.shared.rooms.get_or_create(&session).await;
            let mut document = room.document().await;
            if document.is_closed() {
                continue;
            }

            match document.join(&user, self.id, max_peers) {
                Ok(color) => {
                    // Subscribe before unlocking so no later change is missed.
                    let events = room.group().subscribe();
                    let initial = document.initial_state();
                    room.group().send(
                        Delivery::Others(self.id),
                        &ServerMessage::PeerJoined {
                            user: user.clone(),
                            color,
                        },
                    )?;
                    room.group().send(Delivery::Everyone, &document.user_list())?;
                    drop(document);
                    break (room, color, events, initial);
                }
                Err(e) => {
                    drop(document);
                    log::info!("Rejected {user} from session {session}: {e}");
                    self.shared.stats.write().await.rejected_joins += 1;
                    self.shared.rooms.remove_if_empty(&session).await;
                    reply(ws_sender, &ServerMessage::Error { message: e.to_string() }).await?;
                    return Ok(Flow::Continue);
                }
            }
        };

        log::info!("{user} joined session {session} as {color} from {}", self.addr);
        self.membership = Some(Membership {
            room,
            session,
            user,
            events,
        });
        self.refresh_room_count().await;

        reply(ws_sender, &initial).await?;
        Ok(Flow::Continue)
    }

    async fn recover_from_lag(&self, skipped: u64) -> Result<(), ServerError> {
        let Some(membership) = &self.membership else {
            return Ok(());
        };
        let room = &membership.room;
        room.group().record_lag(skipped);
        log::warn!("{} lagged by {skipped} events, pushing snapshot", membership.user);

        let document = room.document().await;
        room.group().send(Delivery::Only(self.id), &document.snapshot_message())?;
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), ServerError> {
        if let Some(membership) = &self.membership {
            let document = membership.room.document().await;
            membership
                .room
                .group()
                .send(Delivery::Only(self.id), &document.checksum_message())?;
        }
        Ok(())
    }

    /// Unregister from the session, announce it and drop the room if empty.
    async fn leave_session(&mut self) {
        let Some(membership) = self.membership.take() else {
            return;
        };
        let room = &membership.room;

        {
            let mut document = room.document().await;
            if document.leave(&membership.user, self.id) {
                let left = ServerMessage::PeerLeft {
                    user: membership.user.clone(),
                };
                for message in [left, document.user_list()] {
                    if let Err(e) = room.group().send(Delivery::Others(self.id), &message) {
                        log::warn!("failed to announce departure of {}: {e}", membership.user);
                    }
                }
            }
        }
        log::info!("{} left session {}", membership.user, membership.session);

        self.shared.rooms.remove_if_empty(&membership.session).await;
        self.refresh_room_count().await;
    }

    async fn refresh_room_count(&self) {
        let count = self.shared.rooms.room_count().await;
        self.shared.stats.write().await.active_rooms = count;
    }
}

async fn next_event(membership: &mut Option<Membership>) -> Result<Arc<RoomEvent>, RecvError> {
    match membership {
        Some(m) => m.events.recv().await,
        // Not joined yet: nothing to forward.
        None => std::future::pending().await,
    }
}

async fn reply(ws_sender: &mut WsSender, message: &ServerMessage) -> Result<(), ServerError> {
    ws_sender.send(Message::Text(message.to_json()?.into())).await?;
    Ok(())
}
