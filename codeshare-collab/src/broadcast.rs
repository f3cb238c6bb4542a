//! Per-session fan-out and the session registry.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! events; a receiver that falls further behind observes `Lagged` and is
//! resynchronized by its connection task.
//!
//! Every message for a session member goes through this channel, including
//! the ones addressed to a single connection (acks, heartbeats, snapshot
//! replies). Sends happen while the session document is locked, so each
//! connection observes events in the order the document changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::session::SessionRoom;

/// Server-side identity of one WebSocket connection.
pub type ConnectionId = Uuid;

/// Which subscribers an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Everyone,
    /// Everyone but the originating connection.
    Others(ConnectionId),
    /// A single connection.
    Only(ConnectionId),
}

/// A pre-encoded server message plus its audience.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub delivery: Delivery,
    pub kind: &'static str,
    /// JSON text, encoded once for all receivers.
    pub payload: String,
}

impl RoomEvent {
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        match self.delivery {
            Delivery::Everyone => true,
            Delivery::Others(origin) => origin != connection,
            Delivery::Only(target) => target == connection,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Events skipped by lagging receivers.
    pub messages_dropped: u64,
    pub receivers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel shared by every connection of one session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of events buffered per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.sender.subscribe()
    }

    /// Encode `message` once and hand it to every receiver.
    ///
    /// Returns the number of receivers, filtering by [`Delivery`] is the
    /// receiving side's job.
    pub fn send(&self, delivery: Delivery, message: &ServerMessage) -> Result<usize, ProtocolError> {
        let event = RoomEvent {
            delivery,
            kind: message.kind(),
            payload: message.to_json()?,
        };
        Ok(self.send_event(Arc::new(event)))
    }

    /// Send an already encoded event.
    pub fn send_event(&self, event: Arc<RoomEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for events a lagging receiver never saw.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Session name → room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<SessionRoom>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `session`.
    pub async fn get_or_create(&self, session: &str) -> Arc<SessionRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Someone may have created it between the two locks.
        if let Some(room) = rooms.get(session) {
            return room.clone();
        }

        log::info!("creating session {session}");
        let room = Arc::new(SessionRoom::new(session, self.default_capacity));
        rooms.insert(session.to_owned(), room.clone());
        room
    }

    pub async fn get(&self, session: &str) -> Option<Arc<SessionRoom>> {
        self.rooms.read().await.get(session).cloned()
    }

    /// Drop the room once its last member is gone.
    pub async fn remove_if_empty(&self, session: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(session) else {
            return false;
        };
        {
            let mut document = room.document().await;
            if !document.is_empty() {
                return false;
            }
            // Joiners still holding this room must look it up again.
            document.close();
        }
        rooms.remove(session);
        log::info!("closed empty session {session}");
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
