//! Authoritative state of one session, as held by the server.
//!
//! The document behind the room's mutex is the sequencer: batches are
//! applied to it one at a time in arrival order, and each applied batch
//! bumps the revision by one. Everything a late joiner needs (snapshot,
//! members, colors, cursors, revision) is read from it under the same lock.
//!
//! A batch names the revision it was written against. The batches
//! sequenced after that revision by other members are kept in a bounded
//! history, and the incoming batch is rebased past them before it is
//! applied, so two batches touching disjoint ranges give the same document
//! in either arrival order.

use std::collections::{BTreeMap, VecDeque};

use codeshare_core::{apply_batch, checksum, transform_batch, Operation, Position};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::broadcast::{BroadcastGroup, ConnectionId};
use crate::presence::PeerColor;
use crate::protocol::ServerMessage;

/// Why a join was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("session and user must not be empty")]
    EmptyIdentity,
    #[error("session {0} is full")]
    Full(String),
    #[error("user {0} is already connected to this session")]
    DuplicateUser(String),
}

/// A connected member of a session.
#[derive(Debug, Clone)]
pub struct Member {
    pub connection: ConnectionId,
    pub color: PeerColor,
    pub cursor: Option<Position>,
}

/// Sequenced batches kept for rebasing late arrivals.
pub const HISTORY_LIMIT: usize = 256;

/// Result of sequencing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced {
    pub revision: u64,
    /// The batch as applied, after rebasing. This is what other members get.
    pub operations: Vec<Operation>,
    pub snapshot: String,
    pub checksum: String,
    pub clamped: bool,
    /// The batch overlapped a concurrent one; the result depends on order.
    pub overlapped: bool,
}

#[derive(Debug)]
struct HistoryEntry {
    revision: u64,
    author: String,
    operations: Vec<Operation>,
}

/// The server's copy of a session document plus its membership.
#[derive(Debug)]
pub struct SessionDocument {
    name: String,
    snapshot: String,
    revision: u64,
    history: VecDeque<HistoryEntry>,
    members: BTreeMap<String, Member>,
    closed: bool,
}

impl SessionDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: String::new(),
            revision: 0,
            history: VecDeque::new(),
            members: BTreeMap::new(),
            closed: false,
        }
    }

    /// Register `user` and assign it a color unique within the session.
    pub fn join(&mut self, user: &str, connection: ConnectionId, max_peers: usize) -> Result<PeerColor, JoinError> {
        if user.is_empty() || self.name.is_empty() {
            return Err(JoinError::EmptyIdentity);
        }
        if self.members.contains_key(user) {
            return Err(JoinError::DuplicateUser(user.to_owned()));
        }
        if self.members.len() >= max_peers {
            return Err(JoinError::Full(self.name.clone()));
        }

        let color = PeerColor::assign(self.members.values().map(|m| &m.color), user);
        self.members.insert(
            user.to_owned(),
            Member {
                connection,
                color,
                cursor: None,
            },
        );
        Ok(color)
    }

    /// Unregister `user` if it is still bound to `connection`.
    pub fn leave(&mut self, user: &str, connection: ConnectionId) -> bool {
        match self.members.get(user) {
            Some(member) if member.connection == connection => {
                self.members.remove(user);
                true
            }
            _ => false,
        }
    }

    /// Sequence a batch `author` wrote against revision `base`.
    ///
    /// The batch is rebased past every batch other members got sequenced
    /// after `base`; the author's own are already part of what it edited.
    /// `claimed` is the snapshot the author ended up with; it differs from
    /// ours whenever concurrent batches were sequenced in between.
    pub fn apply(&mut self, author: &str, base: u64, operations: &[Operation], claimed: &str) -> Sequenced {
        let oldest = self.history.front().map_or(self.revision + 1, |entry| entry.revision);
        if base.saturating_add(1) < oldest {
            log::warn!(
                "session {}: batch from {author} based on revision {base}, history starts at {oldest}",
                self.name
            );
        }

        let prior: Vec<Operation> = self
            .history
            .iter()
            .filter(|entry| entry.revision > base && entry.author != author)
            .flat_map(|entry| entry.operations.iter().cloned())
            .collect();
        let rebased = transform_batch(operations, &prior);
        if rebased.overlapped {
            log::debug!(
                "session {}: batch from {author} overlaps concurrent edits since revision {base}",
                self.name
            );
        }

        let applied = apply_batch(&self.snapshot, &rebased.operations);
        if applied.text != claimed {
            log::trace!(
                "session {}: batch from {author} sequenced over concurrent edits at revision {}",
                self.name,
                self.revision + 1
            );
        }

        self.snapshot = applied.text;
        self.revision += 1;
        self.history.push_back(HistoryEntry {
            revision: self.revision,
            author: author.to_owned(),
            operations: rebased.operations.clone(),
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        Sequenced {
            revision: self.revision,
            operations: rebased.operations,
            snapshot: self.snapshot.clone(),
            checksum: checksum(&self.snapshot),
            clamped: applied.clamped,
            overlapped: rebased.overlapped,
        }
    }

    /// Store the cursor of a member. Unknown users are ignored.
    pub fn set_cursor(&mut self, user: &str, position: Position) -> bool {
        match self.members.get_mut(user) {
            Some(member) => {
                member.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    pub fn initial_state(&self) -> ServerMessage {
        ServerMessage::InitialState {
            snapshot: self.snapshot.clone(),
            peers: self.members.keys().cloned().collect(),
            peer_colors: self.peer_colors(),
            cursor_positions: self
                .members
                .iter()
                .filter_map(|(user, m)| m.cursor.map(|c| (user.clone(), c)))
                .collect(),
            revision: self.revision,
        }
    }

    pub fn user_list(&self) -> ServerMessage {
        ServerMessage::UserList {
            peers: self.members.keys().cloned().collect(),
            peer_colors: self.peer_colors(),
        }
    }

    pub fn snapshot_message(&self) -> ServerMessage {
        ServerMessage::Snapshot {
            snapshot: self.snapshot.clone(),
            revision: self.revision,
        }
    }

    pub fn checksum_message(&self) -> ServerMessage {
        ServerMessage::Checksum {
            revision: self.revision,
            checksum: checksum(&self.snapshot),
        }
    }

    fn peer_colors(&self) -> BTreeMap<String, PeerColor> {
        self.members.iter().map(|(user, m)| (user.clone(), m.color)).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Set once the room has been dropped from the registry.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

/// A session: its broadcast group and its locked document.
pub struct SessionRoom {
    name: String,
    group: BroadcastGroup,
    document: Mutex<SessionDocument>,
}

impl SessionRoom {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        Self {
            document: Mutex::new(SessionDocument::new(name.clone())),
            group: BroadcastGroup::new(capacity),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Lock the document. Broadcasts that must stay ordered with document
    /// changes are sent while this guard is held.
    pub async fn document(&self) -> MutexGuard<'_, SessionDocument> {
        self.document.lock().await
    }
}
