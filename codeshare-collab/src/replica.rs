//! Session replica: one client's view of a shared document.
//!
//! ## State machine
//!
//! ```text
//!  Disconnected ──join_request()──▶ Connecting ──initial_state──▶ Joined
//!       ▲                               │                           │
//!       └──────── error / leave() / channel failure ────────────────┘
//! ```
//!
//! The replica owns the snapshot, the presence room, the suppression flag
//! and the bookkeeping used to detect divergence (last revision seen, local
//! batches the server has not acknowledged yet). It never touches the
//! network: inbound messages go through [`Replica::handle`], outbound ones
//! are returned to the caller.
//!
//! ## Echo suppression
//!
//! Pushing remote content into the view makes most editors raise a change
//! notification of their own. What keeps that from being sent back as a
//! new batch is the diff: the replica updates its snapshot before touching
//! the view, so the notification carries text the replica already holds
//! and [`Replica::local_change`] finds nothing to emit.
//!
//! The suppression flag only marks the window in which the view is being
//! written. A guard raises it and lowers it on drop, including when the
//! view panics. `handle` borrows the replica mutably for that whole window,
//! so a notification can only reach `local_change` after the flag is down,
//! where the diff above drops it. The flag check in `local_change` is a
//! backstop, not the mechanism.
//!
//! ## Remote batches
//!
//! The server rebases every batch past whatever was sequenced since its
//! author last synced, so a replica with nothing in flight applies remote
//! batches as they come. Local batches still awaiting their ack are not
//! part of what the server had when it sequenced a remote batch; the
//! remote batch is rebased past them first, and they are rebased past it
//! in turn, matching what the server will do when it sequences them.
//!
//! ## Divergence repair
//!
//! With no local batch in flight the replica is exactly at the server's
//! revision, so it can compare blake3 digests from `ack` / `checksum`
//! messages and each remote batch's resulting snapshot against its own. A
//! mismatch or a clamped remote operation triggers a `sync_request`; the
//! `snapshot` reply replaces the local document.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use codeshare_core::{apply_batch, checksum, compute_operations, rebase, Operation, OperationBatch, Position};

use crate::presence::{CursorMarker, PeerColor, PresenceRoom, CURSOR_BROADCAST_INTERVAL};
use crate::protocol::{ClientMessage, ServerMessage};

/// The editor surface driven by a replica.
pub trait EditorView {
    /// Replace the whole visible document.
    fn set_contents(&mut self, text: &str);
    /// Draw a remote cursor. At most one marker per user is shown.
    fn place_marker(&mut self, marker: &CursorMarker);
    /// Remove the marker of `user`, if any.
    fn clear_marker(&mut self, user: &str);
}

/// An [`EditorView`] that only records what it was told to show.
#[derive(Debug, Default, Clone)]
pub struct HeadlessView {
    pub contents: String,
    pub markers: BTreeMap<String, CursorMarker>,
    /// Number of `set_contents` calls.
    pub renders: usize,
}

impl EditorView for HeadlessView {
    fn set_contents(&mut self, text: &str) {
        self.contents.clear();
        self.contents.push_str(text);
        self.renders += 1;
    }

    fn place_marker(&mut self, marker: &CursorMarker) {
        self.markers.insert(marker.user.clone(), marker.clone());
    }

    fn clear_marker(&mut self, user: &str) {
        self.markers.remove(user);
    }
}

/// Connection state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
}

/// Why the replica asked for, or adopted, an authoritative snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// `ack` or `checksum` digest differs from the local snapshot.
    ChecksumMismatch,
    /// A remote operation pointed outside the local document.
    ClampedOperation,
    /// A remote batch did not reproduce the snapshot it carried.
    DivergedFromBatch,
    /// Asked for explicitly by the application.
    Requested,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Joined { revision: u64, peers: usize },
    RemoteEdit { user: String, revision: u64 },
    PeerJoined { user: String, color: PeerColor },
    PeerLeft { user: String },
    CursorMoved { user: String, position: Position },
    Acknowledged { revision: u64 },
    ResyncRequested { reason: ResyncReason },
    Resynced { revision: u64, reason: ResyncReason },
    ServerError { message: String },
    Disconnected { reason: String },
}

/// Outcome of handling one inbound message.
#[derive(Debug, Default)]
pub struct Reaction {
    pub events: Vec<SyncEvent>,
    /// Messages to send back to the server.
    pub replies: Vec<ClientMessage>,
}

/// Raises the suppression flag for as long as it lives.
struct Suppression<'a> {
    flag: &'a mut bool,
}

impl<'a> Suppression<'a> {
    fn engage(flag: &'a mut bool) -> Self {
        *flag = true;
        Self { flag }
    }

    fn is_engaged(&self) -> bool {
        *self.flag
    }
}

impl Drop for Suppression<'_> {
    fn drop(&mut self) {
        *self.flag = false;
    }
}

/// Client-side state of one collaborative session.
pub struct Replica {
    session: String,
    user: String,
    state: ConnectionState,
    snapshot: String,
    presence: PresenceRoom,
    suppressed: bool,
    /// Last server revision this replica has caught up with.
    revision: u64,
    /// Local batches sent but not acknowledged yet, oldest first, rebased
    /// past every remote batch received since they were sent.
    unacked: VecDeque<Vec<Operation>>,
    /// Set while a `sync_request` is outstanding.
    pending_resync: Option<ResyncReason>,
}

impl Replica {
    pub fn new(session: impl Into<String>, user: impl Into<String>) -> Self {
        Self::with_cursor_interval(session, user, CURSOR_BROADCAST_INTERVAL)
    }

    pub fn with_cursor_interval(
        session: impl Into<String>,
        user: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let user = user.into();
        Self {
            session: session.into(),
            presence: PresenceRoom::with_interval(user.clone(), interval),
            user,
            state: ConnectionState::Disconnected,
            snapshot: String::new(),
            suppressed: false,
            revision: 0,
            unacked: VecDeque::new(),
            pending_resync: None,
        }
    }

    /// Start joining; the returned `join` must be the first message sent.
    pub fn join_request(&mut self) -> ClientMessage {
        self.state = ConnectionState::Connecting;
        ClientMessage::Join {
            session: self.session.clone(),
            user: self.user.clone(),
        }
    }

    /// The local editor now shows `text`.
    ///
    /// Returns the batch to send, or `None` while suppressed, before the
    /// join completed, or when nothing changed.
    pub fn local_change(&mut self, text: &str) -> Option<ClientMessage> {
        if self.suppressed || self.state != ConnectionState::Joined {
            return None;
        }
        let operations = compute_operations(&self.snapshot, text);
        if operations.is_empty() {
            return None;
        }

        self.snapshot.clear();
        self.snapshot.push_str(text);
        self.unacked.push_back(operations.clone());
        log::trace!("local batch of {} operations, {} unacked", operations.len(), self.unacked.len());

        Some(OperationBatch::new(self.user.clone(), self.revision, operations, self.snapshot.clone()).into())
    }

    /// The local cursor moved. Rate limited.
    pub fn local_cursor(&mut self, position: Position) -> Option<ClientMessage> {
        if self.suppressed || self.state != ConnectionState::Joined {
            return None;
        }
        self.presence.update_local_cursor(position)
    }

    /// Send the last local cursor regardless of the rate limit.
    pub fn force_cursor(&mut self) -> Option<ClientMessage> {
        if self.state != ConnectionState::Joined {
            return None;
        }
        Some(self.presence.force_cursor_broadcast())
    }

    /// Ask the server for its snapshot. `None` if one is already on its way.
    pub fn request_resync(&mut self, reason: ResyncReason) -> Option<ClientMessage> {
        if self.state != ConnectionState::Joined || self.pending_resync.is_some() {
            return None;
        }
        self.pending_resync = Some(reason);
        Some(ClientMessage::SyncRequest {
            user: self.user.clone(),
        })
    }

    /// Leave the session. The notification is best-effort.
    pub fn leave<V: EditorView + ?Sized>(&mut self, view: &mut V) -> Option<ClientMessage> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.reset_session(view);
        Some(ClientMessage::Leave {
            user: self.user.clone(),
        })
    }

    /// The channel is gone.
    pub fn disconnected<V: EditorView + ?Sized>(&mut self, reason: impl Into<String>, view: &mut V) -> SyncEvent {
        self.reset_session(view);
        SyncEvent::Disconnected { reason: reason.into() }
    }

    fn reset_session<V: EditorView + ?Sized>(&mut self, view: &mut V) {
        for peer in self.presence.peers() {
            view.clear_marker(&peer.user);
        }
        self.presence.reset(&[], &BTreeMap::new(), &BTreeMap::new());
        self.state = ConnectionState::Disconnected;
        self.unacked.clear();
        self.pending_resync = None;
    }

    /// Apply one inbound message.
    pub fn handle<V: EditorView + ?Sized>(&mut self, message: ServerMessage, view: &mut V) -> Reaction {
        let mut reaction = Reaction::default();

        match (self.state, message) {
            (ConnectionState::Disconnected, message) => {
                log::debug!("dropping {} while disconnected", message.kind());
            }

            (
                _,
                ServerMessage::InitialState {
                    snapshot,
                    peers,
                    peer_colors,
                    cursor_positions,
                    revision,
                },
            ) => {
                for peer in self.presence.peers() {
                    view.clear_marker(&peer.user);
                }
                self.presence.reset(&peers, &peer_colors, &cursor_positions);
                {
                    let _guard = Suppression::engage(&mut self.suppressed);
                    self.snapshot = snapshot;
                    view.set_contents(&self.snapshot);
                    for marker in self.presence.markers() {
                        view.place_marker(&marker);
                    }
                }
                self.state = ConnectionState::Joined;
                self.revision = revision;
                self.unacked.clear();
                self.pending_resync = None;

                log::info!(
                    "joined session {} as {} at revision {revision} with {} peers",
                    self.session,
                    self.user,
                    self.presence.peer_count()
                );
                reaction.events.push(SyncEvent::Joined {
                    revision,
                    peers: self.presence.peer_count(),
                });
            }

            (state, ServerMessage::Error { message }) => {
                if state == ConnectionState::Connecting {
                    log::warn!("join of session {} rejected: {message}", self.session);
                    self.state = ConnectionState::Disconnected;
                } else {
                    log::warn!("server error: {message}");
                }
                reaction.events.push(SyncEvent::ServerError { message });
            }

            (ConnectionState::Connecting, message) => {
                log::debug!("dropping {} before initial state", message.kind());
            }

            (ConnectionState::Joined, message) if message.origin() == Some(self.user.as_str()) => {
                log::debug!("ignoring echo of own {}", message.kind());
            }

            (
                ConnectionState::Joined,
                ServerMessage::Operation {
                    user,
                    operations,
                    snapshot,
                    revision,
                },
            ) => self.apply_remote(user, &operations, snapshot, revision, view, &mut reaction),

            (ConnectionState::Joined, ServerMessage::UserList { peers, peer_colors }) => {
                let changes = self.presence.sync_user_list(&peers, &peer_colors);
                for user in changes.left {
                    view.clear_marker(&user);
                    reaction.events.push(SyncEvent::PeerLeft { user });
                }
                for user in changes.joined {
                    if let Some(peer) = self.presence.peer(&user) {
                        reaction.events.push(SyncEvent::PeerJoined {
                            color: peer.color,
                            user,
                        });
                    }
                }
            }

            (ConnectionState::Joined, ServerMessage::PeerJoined { user, color }) => {
                if self.presence.add_peer(&user, color) {
                    reaction.events.push(SyncEvent::PeerJoined { user, color });
                }
            }

            (ConnectionState::Joined, ServerMessage::PeerLeft { user }) => {
                if self.presence.remove_peer(&user).is_some() {
                    view.clear_marker(&user);
                    reaction.events.push(SyncEvent::PeerLeft { user });
                }
            }

            (ConnectionState::Joined, ServerMessage::Cursor { user, position }) => {
                if let Some(marker) = self.presence.handle_cursor(&user, position) {
                    view.clear_marker(&user);
                    view.place_marker(&marker);
                    reaction.events.push(SyncEvent::CursorMoved { user, position });
                }
            }

            (ConnectionState::Joined, ServerMessage::Ack { revision, checksum: digest }) => {
                self.unacked.pop_front();
                self.revision = revision;
                reaction.events.push(SyncEvent::Acknowledged { revision });

                if self.unacked.is_empty() && checksum(&self.snapshot) != digest {
                    log::warn!("snapshot differs from server after ack of revision {revision}");
                    self.push_resync(ResyncReason::ChecksumMismatch, &mut reaction);
                }
            }

            (ConnectionState::Joined, ServerMessage::Checksum { revision, checksum: digest }) => {
                let comparable = self.unacked.is_empty() && revision == self.revision;
                if comparable && checksum(&self.snapshot) != digest {
                    log::warn!("snapshot differs from server at revision {revision}");
                    self.push_resync(ResyncReason::ChecksumMismatch, &mut reaction);
                }
            }

            (ConnectionState::Joined, ServerMessage::Snapshot { snapshot, revision }) => {
                let reason = self.pending_resync.take().unwrap_or(ResyncReason::Requested);
                {
                    let _guard = Suppression::engage(&mut self.suppressed);
                    self.snapshot = snapshot;
                    view.set_contents(&self.snapshot);
                }
                self.revision = revision;
                // Acks lost to a lagging channel would otherwise disable
                // checksum comparison for good.
                self.unacked.clear();
                log::info!("adopted server snapshot at revision {revision} ({reason:?})");
                reaction.events.push(SyncEvent::Resynced { revision, reason });
            }

            (ConnectionState::Joined, ServerMessage::Pong) => {
                log::trace!("pong");
            }
        }

        reaction
    }

    fn apply_remote<V: EditorView + ?Sized>(
        &mut self,
        user: String,
        operations: &[Operation],
        snapshot: String,
        revision: u64,
        view: &mut V,
        reaction: &mut Reaction,
    ) {
        let mut incoming = operations.to_vec();
        for batch in self.unacked.iter_mut() {
            let rebased = rebase(&incoming, batch, false);
            *batch = rebased.carried;
            incoming = rebased.operations;
        }

        let applied = apply_batch(&self.snapshot, &incoming);
        // Only meaningful when we hold no unacknowledged edits of our own.
        let adopt = self.unacked.is_empty() && applied.text != snapshot;
        {
            let guard = Suppression::engage(&mut self.suppressed);
            debug_assert!(guard.is_engaged());
            self.snapshot = if adopt { snapshot } else { applied.text };
            view.set_contents(&self.snapshot);
        }
        self.revision = self.revision.max(revision);

        log::debug!("applied {} operations from {user} at revision {revision}", operations.len());
        reaction.events.push(SyncEvent::RemoteEdit { user, revision });

        if adopt {
            log::warn!("batch at revision {revision} diverged locally, adopting its snapshot");
            reaction.events.push(SyncEvent::Resynced {
                revision,
                reason: ResyncReason::DivergedFromBatch,
            });
        } else if applied.clamped {
            log::warn!("batch at revision {revision} was clamped");
            self.push_resync(ResyncReason::ClampedOperation, reaction);
        }
    }

    fn push_resync(&mut self, reason: ResyncReason, reaction: &mut Reaction) {
        if let Some(request) = self.request_resync(reason) {
            reaction.replies.push(request);
            reaction.events.push(SyncEvent::ResyncRequested { reason });
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_acks(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PALETTE;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn joined(user: &str, snapshot: &str, peers: &[&str]) -> (Replica, HeadlessView) {
        let mut replica = Replica::with_cursor_interval("room", user, Duration::ZERO);
        let mut view = HeadlessView::default();
        replica.join_request();

        let mut all: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        all.push(user.to_string());
        let colors = all
            .iter()
            .zip(PALETTE.iter())
            .map(|(u, c)| (u.clone(), *c))
            .collect();

        replica.handle(
            ServerMessage::InitialState {
                snapshot: snapshot.into(),
                peers: all,
                peer_colors: colors,
                cursor_positions: BTreeMap::new(),
                revision: 3,
            },
            &mut view,
        );
        (replica, view)
    }

    fn remote(user: &str, operations: Vec<Operation>, snapshot: &str, revision: u64) -> ServerMessage {
        ServerMessage::Operation {
            user: user.into(),
            operations,
            snapshot: snapshot.into(),
            revision,
        }
    }

    #[test]
    fn test_state_machine() {
        let mut replica = Replica::new("room", "alice");
        assert_eq!(replica.state(), ConnectionState::Disconnected);

        let join = replica.join_request();
        assert_eq!(
            join,
            ClientMessage::Join {
                session: "room".into(),
                user: "alice".into(),
            }
        );
        assert_eq!(replica.state(), ConnectionState::Connecting);

        let (mut replica, mut view) = joined("alice", "", &[]);
        assert_eq!(replica.state(), ConnectionState::Joined);
        assert!(replica.leave(&mut view).is_some());
        assert_eq!(replica.state(), ConnectionState::Disconnected);
        assert!(replica.leave(&mut view).is_none());
    }

    #[test]
    fn test_initial_state_replaces_everything() {
        let mut replica = Replica::new("room", "carol");
        let mut view = HeadlessView::default();
        replica.join_request();

        let mut cursors = BTreeMap::new();
        cursors.insert("alice".to_string(), Position::new(0, 2));
        let reaction = replica.handle(
            ServerMessage::InitialState {
                snapshot: "shared text".into(),
                peers: vec!["alice".into(), "bob".into(), "carol".into()],
                peer_colors: BTreeMap::new(),
                cursor_positions: cursors,
                revision: 12,
            },
            &mut view,
        );

        assert_eq!(reaction.events, vec![SyncEvent::Joined { revision: 12, peers: 2 }]);
        assert_eq!(replica.snapshot(), "shared text");
        assert_eq!(view.contents, "shared text");
        assert_eq!(replica.revision(), 12);
        assert!(view.markers.contains_key("alice"));
        assert!(!replica.is_suppressed());
    }

    #[test]
    fn test_local_change_before_join_is_dropped() {
        let mut replica = Replica::new("room", "alice");
        assert!(replica.local_change("hello").is_none());
        replica.join_request();
        assert!(replica.local_change("hello").is_none());
    }

    #[test]
    fn test_local_change_emits_batch() {
        let (mut replica, _) = joined("alice", "", &[]);
        let msg = replica.local_change("hello").unwrap();
        assert_eq!(
            msg,
            ClientMessage::Operation {
                user: "alice".into(),
                operations: vec![Operation::insert(0, "hello")],
                snapshot: "hello".into(),
                revision: 3,
            }
        );
        assert_eq!(replica.pending_acks(), 1);
        assert!(replica.local_change("hello").is_none());
    }

    #[test]
    fn test_remote_batch_applied_without_reemission() {
        let (mut replica, mut view) = joined("bob", "", &["alice"]);
        let reaction = replica.handle(remote("alice", vec![Operation::insert(0, "hello")], "hello", 4), &mut view);

        assert_eq!(
            reaction.events,
            vec![SyncEvent::RemoteEdit {
                user: "alice".into(),
                revision: 4,
            }]
        );
        assert!(reaction.replies.is_empty());
        assert_eq!(replica.snapshot(), "hello");
        assert_eq!(view.contents, "hello");
        // The view's own change notification comes back with the same text.
        assert!(replica.local_change(&view.contents).is_none());
    }

    #[test]
    fn test_view_echo_after_remote_batches_emits_nothing() {
        let (mut replica, mut view) = joined("bob", "fn main() {}", &["alice"]);
        let batches = [
            (vec![Operation::insert(11, "\n")], "fn main() {\n}"),
            (vec![Operation::delete(0, 2), Operation::insert(0, "pub fn")], "pub fn main() {\n}"),
        ];
        for (i, (operations, snapshot)) in batches.into_iter().enumerate() {
            replica.handle(remote("alice", operations, snapshot, 4 + i as u64), &mut view);
            assert!(!replica.is_suppressed());
            // The editor reports the text it was just given.
            let echoed = view.contents.clone();
            assert!(replica.local_change(&echoed).is_none());
        }
        assert_eq!(replica.pending_acks(), 0);
        assert_eq!(replica.snapshot(), "pub fn main() {\n}");
    }

    #[test]
    fn test_remote_batch_rebased_past_unacked_edit() {
        let (mut replica, mut view) = joined("alice", "abcdef", &["bob"]);
        replica.local_change("bcdef");
        // Bob's insert was sequenced first, written against "abcdef".
        let reaction = replica.handle(remote("bob", vec![Operation::insert(5, "X")], "abcdeXf", 4), &mut view);

        assert_eq!(replica.snapshot(), "bcdeXf");
        assert_eq!(view.contents, "bcdeXf");
        assert!(reaction.replies.is_empty());

        let ack = replica.handle(
            ServerMessage::Ack {
                revision: 5,
                checksum: checksum("bcdeXf"),
            },
            &mut view,
        );
        assert!(ack.replies.is_empty());
        assert_eq!(replica.pending_acks(), 0);
    }

    #[test]
    fn test_own_echo_ignored() {
        let (mut replica, mut view) = joined("alice", "abc", &[]);
        let renders = view.renders;
        let reaction = replica.handle(remote("alice", vec![Operation::delete(0, 3)], "", 4), &mut view);
        assert!(reaction.events.is_empty());
        assert_eq!(replica.snapshot(), "abc");
        assert_eq!(view.renders, renders);
    }

    #[test]
    fn test_suppression_guard_clears_flag() {
        let mut flag = false;
        {
            let guard = Suppression::engage(&mut flag);
            assert!(guard.is_engaged());
        }
        assert!(!flag);
    }

    struct PanickingView;

    impl EditorView for PanickingView {
        fn set_contents(&mut self, _text: &str) {
            panic!("view exploded");
        }
        fn place_marker(&mut self, _marker: &CursorMarker) {}
        fn clear_marker(&mut self, _user: &str) {}
    }

    #[test]
    fn test_suppression_cleared_when_view_panics() {
        let (mut replica, _) = joined("bob", "", &["alice"]);
        let result = catch_unwind(AssertUnwindSafe(|| {
            replica.handle(remote("alice", vec![Operation::insert(0, "x")], "x", 4), &mut PanickingView)
        }));
        assert!(result.is_err());
        assert!(!replica.is_suppressed());
        assert!(replica.local_change("xy").is_some());
    }

    #[test]
    fn test_divergent_batch_adopts_snapshot() {
        let (mut replica, mut view) = joined("bob", "abc", &["alice"]);
        // Batch claims the result is "abcd!" but applying gives "abcd".
        let reaction = replica.handle(remote("alice", vec![Operation::insert(3, "d")], "abcd!", 4), &mut view);
        assert_eq!(replica.snapshot(), "abcd!");
        assert_eq!(view.contents, "abcd!");
        assert!(reaction.events.contains(&SyncEvent::Resynced {
            revision: 4,
            reason: ResyncReason::DivergedFromBatch,
        }));
    }

    #[test]
    fn test_clamped_batch_requests_resync() {
        let (mut replica, mut view) = joined("bob", "ab", &["alice"]);
        replica.local_change("abX");
        let reaction = replica.handle(remote("alice", vec![Operation::delete(2, 9)], "ab", 4), &mut view);
        assert_eq!(reaction.replies, vec![ClientMessage::SyncRequest { user: "bob".into() }]);
        assert!(reaction.events.contains(&SyncEvent::ResyncRequested {
            reason: ResyncReason::ClampedOperation,
        }));
    }

    #[test]
    fn test_ack_checksum_match() {
        let (mut replica, mut view) = joined("alice", "", &[]);
        replica.local_change("hello");
        let reaction = replica.handle(
            ServerMessage::Ack {
                revision: 4,
                checksum: checksum("hello"),
            },
            &mut view,
        );
        assert_eq!(reaction.events, vec![SyncEvent::Acknowledged { revision: 4 }]);
        assert!(reaction.replies.is_empty());
        assert_eq!(replica.pending_acks(), 0);
        assert_eq!(replica.revision(), 4);
    }

    #[test]
    fn test_ack_checksum_mismatch_then_snapshot() {
        let (mut replica, mut view) = joined("alice", "", &[]);
        replica.local_change("hello");
        let reaction = replica.handle(
            ServerMessage::Ack {
                revision: 5,
                checksum: checksum("hello world"),
            },
            &mut view,
        );
        assert_eq!(reaction.replies.len(), 1);

        // A second mismatch while the request is outstanding sends nothing.
        let again = replica.handle(
            ServerMessage::Checksum {
                revision: 5,
                checksum: checksum("hello world"),
            },
            &mut view,
        );
        assert!(again.replies.is_empty());

        let reaction = replica.handle(
            ServerMessage::Snapshot {
                snapshot: "hello world".into(),
                revision: 5,
            },
            &mut view,
        );
        assert_eq!(
            reaction.events,
            vec![SyncEvent::Resynced {
                revision: 5,
                reason: ResyncReason::ChecksumMismatch,
            }]
        );
        assert_eq!(view.contents, "hello world");
        assert!(replica.local_change("hello world").is_none());
    }

    #[test]
    fn test_heartbeat_ignored_while_batches_unacked() {
        let (mut replica, mut view) = joined("alice", "", &[]);
        replica.local_change("x");
        let reaction = replica.handle(
            ServerMessage::Checksum {
                revision: 3,
                checksum: checksum(""),
            },
            &mut view,
        );
        assert!(reaction.replies.is_empty());
    }

    #[test]
    fn test_heartbeat_mismatch_at_same_revision() {
        let (mut replica, mut view) = joined("alice", "abc", &[]);
        let reaction = replica.handle(
            ServerMessage::Checksum {
                revision: 3,
                checksum: checksum("abd"),
            },
            &mut view,
        );
        assert_eq!(reaction.replies, vec![ClientMessage::SyncRequest { user: "alice".into() }]);
    }

    #[test]
    fn test_peer_join_and_leave() {
        let (mut replica, mut view) = joined("alice", "", &["bob", "carol"]);
        replica.handle(
            ServerMessage::Cursor {
                user: "bob".into(),
                position: Position::new(0, 0),
            },
            &mut view,
        );
        replica.handle(
            ServerMessage::Cursor {
                user: "carol".into(),
                position: Position::new(0, 0),
            },
            &mut view,
        );

        let reaction = replica.handle(ServerMessage::PeerLeft { user: "bob".into() }, &mut view);
        assert_eq!(reaction.events, vec![SyncEvent::PeerLeft { user: "bob".into() }]);
        assert!(replica.presence().peer("bob").is_none());
        assert!(!view.markers.contains_key("bob"));
        assert!(view.markers.contains_key("carol"));

        let reaction = replica.handle(
            ServerMessage::PeerJoined {
                user: "dave".into(),
                color: PALETTE[5],
            },
            &mut view,
        );
        assert_eq!(
            reaction.events,
            vec![SyncEvent::PeerJoined {
                user: "dave".into(),
                color: PALETTE[5],
            }]
        );
    }

    #[test]
    fn test_cursor_replaces_marker() {
        let (mut replica, mut view) = joined("alice", "line\nline", &["bob"]);
        replica.handle(
            ServerMessage::Cursor {
                user: "bob".into(),
                position: Position::new(0, 1),
            },
            &mut view,
        );
        replica.handle(
            ServerMessage::Cursor {
                user: "bob".into(),
                position: Position::new(1, 3),
            },
            &mut view,
        );
        assert_eq!(view.markers.len(), 1);
        assert_eq!(view.markers["bob"].position, Position::new(1, 3));
        assert_eq!(view.markers["bob"].color, PALETTE[0]);
    }

    #[test]
    fn test_user_list_reconciles() {
        let (mut replica, mut view) = joined("alice", "", &["bob"]);
        let reaction = replica.handle(
            ServerMessage::UserList {
                peers: vec!["alice".into(), "carol".into()],
                peer_colors: BTreeMap::new(),
            },
            &mut view,
        );
        assert!(reaction.events.contains(&SyncEvent::PeerLeft { user: "bob".into() }));
        assert_eq!(replica.presence().peer_count(), 1);
    }

    #[test]
    fn test_join_rejected() {
        let mut replica = Replica::new("room", "alice");
        let mut view = HeadlessView::default();
        replica.join_request();
        let reaction = replica.handle(
            ServerMessage::Error {
                message: "session room is full".into(),
            },
            &mut view,
        );
        assert_eq!(replica.state(), ConnectionState::Disconnected);
        assert_eq!(reaction.events.len(), 1);
    }

    #[test]
    fn test_disconnect_clears_markers() {
        let (mut replica, mut view) = joined("alice", "", &["bob"]);
        replica.handle(
            ServerMessage::Cursor {
                user: "bob".into(),
                position: Position::ZERO,
            },
            &mut view,
        );
        let event = replica.disconnected("connection reset", &mut view);
        assert_eq!(
            event,
            SyncEvent::Disconnected {
                reason: "connection reset".into(),
            }
        );
        assert!(view.markers.is_empty());
        assert_eq!(replica.state(), ConnectionState::Disconnected);
        assert!(replica.local_change("later").is_none());
    }

    #[test]
    fn test_local_cursor_requires_join() {
        let mut replica = Replica::new("room", "alice");
        assert!(replica.local_cursor(Position::new(0, 1)).is_none());
        let (mut replica, _) = joined("alice", "", &[]);
        assert!(replica.local_cursor(Position::new(0, 1)).is_some());
        assert!(replica.force_cursor().is_some());
    }
}
