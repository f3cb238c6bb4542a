//! Presence: peer colors, remote cursor markers and local cursor throttling.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (rate-limited: 33ms)
//!       ▼
//! ClientMessage::Cursor { user, position }
//!       │
//!       ▼   (WebSocket, fanned out by the server)
//! Remote PresenceRoom::handle_cursor()
//!       │
//!       ▼
//! CursorMarker { color bar + identity label } → EditorView
//! ```
//!
//! The server hands out colors from a fixed palette, unique within a
//! session. Once the palette is exhausted, or when a cursor arrives from a
//! peer we have never been told about, a stable color is derived from the
//! user id instead.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use codeshare_core::Position;
use serde::{Deserialize, Serialize};

use crate::protocol::ClientMessage;

/// Minimum spacing between two outgoing cursor updates.
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// Colors handed out by the server, in assignment order.
pub const PALETTE: [PeerColor; 10] = [
    PeerColor::rgb(0xFF, 0x57, 0x33),
    PeerColor::rgb(0x33, 0xFF, 0x57),
    PeerColor::rgb(0x33, 0x57, 0xFF),
    PeerColor::rgb(0xFF, 0x33, 0xA1),
    PeerColor::rgb(0xA1, 0x33, 0xFF),
    PeerColor::rgb(0x33, 0xFF, 0xF6),
    PeerColor::rgb(0xFF, 0xD4, 0x33),
    PeerColor::rgb(0xFF, 0x33, 0x33),
    PeerColor::rgb(0x33, 0xFF, 0x8A),
    PeerColor::rgb(0x8A, 0x33, 0xFF),
];

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Display color of a peer. Serialized as `"#RRGGBB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Stable, vivid color derived from a user id.
    ///
    /// The hue comes from a blake3 hash of the id; saturation and lightness
    /// are fixed so every derived color stays readable as a cursor bar.
    pub fn from_user(user: &str) -> Self {
        let hash = blake3::hash(user.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        let hue = (u64::from_le_bytes(head) % 360) as f32 / 360.0;

        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self::rgb(to_channel(r), to_channel(g), to_channel(b))
    }

    /// First palette color not in `taken`, or the derived color for `user`
    /// once the palette is used up.
    pub fn assign<'a>(taken: impl IntoIterator<Item = &'a PeerColor>, user: &str) -> Self {
        let taken: Vec<&PeerColor> = taken.into_iter().collect();
        PALETTE
            .iter()
            .find(|candidate| !taken.contains(candidate))
            .copied()
            .unwrap_or_else(|| Self::from_user(user))
    }

    /// Parse `#RRGGBB` (the leading `#` is optional).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl fmt::Display for PeerColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<PeerColor> for String {
    fn from(color: PeerColor) -> Self {
        color.to_hex()
    }
}

impl TryFrom<String> for PeerColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid color {value:?}"))
    }
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote peers
// ───────────────────────────────────────────────────────────────────

/// A remote peer as seen by the local replica.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub user: String,
    pub color: PeerColor,
    /// Last known cursor, if the peer has moved it since we joined.
    pub cursor: Option<Position>,
}

impl RemotePeer {
    pub fn new(user: impl Into<String>, color: PeerColor) -> Self {
        Self {
            user: user.into(),
            color,
            cursor: None,
        }
    }

    pub fn update_cursor(&mut self, position: Position) {
        self.cursor = Some(position);
    }

    pub fn marker(&self) -> Option<CursorMarker> {
        self.cursor.map(|position| CursorMarker {
            user: self.user.clone(),
            color: self.color,
            position,
        })
    }
}

/// What the editor draws for a remote cursor: a bar in the peer's color
/// with the peer's identity as label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorMarker {
    pub user: String,
    pub color: PeerColor,
    pub position: Position,
}

impl CursorMarker {
    pub fn label(&self) -> &str {
        &self.user
    }
}

/// Peers added and removed by a user-list reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerChanges {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state of one session from the point of view of the local user.
pub struct PresenceRoom {
    local_user: String,
    peers: BTreeMap<String, RemotePeer>,
    /// `None` until the first cursor update goes out.
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
    local_cursor: Position,
}

impl PresenceRoom {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self::with_interval(local_user, CURSOR_BROADCAST_INTERVAL)
    }

    /// Create with a custom cursor broadcast interval.
    pub fn with_interval(local_user: impl Into<String>, interval: Duration) -> Self {
        Self {
            local_user: local_user.into(),
            peers: BTreeMap::new(),
            last_cursor_broadcast: None,
            cursor_broadcast_interval: interval,
            local_cursor: Position::ZERO,
        }
    }

    /// Replace every peer with the membership carried by `initial_state`.
    pub fn reset(
        &mut self,
        peers: &[String],
        colors: &BTreeMap<String, PeerColor>,
        cursors: &BTreeMap<String, Position>,
    ) {
        self.peers.clear();
        for user in peers.iter().filter(|u| **u != self.local_user) {
            let color = colors
                .get(user)
                .copied()
                .unwrap_or_else(|| PeerColor::from_user(user));
            let mut peer = RemotePeer::new(user.clone(), color);
            peer.cursor = cursors.get(user).copied();
            self.peers.insert(user.clone(), peer);
        }
    }

    /// Add a peer. Returns `false` for ourselves or an already known peer,
    /// whose color is refreshed.
    pub fn add_peer(&mut self, user: &str, color: PeerColor) -> bool {
        if user == self.local_user {
            return false;
        }
        match self.peers.get_mut(user) {
            Some(peer) => {
                peer.color = color;
                false
            }
            None => {
                self.peers.insert(user.to_owned(), RemotePeer::new(user, color));
                true
            }
        }
    }

    /// Remove exactly `user`.
    pub fn remove_peer(&mut self, user: &str) -> Option<RemotePeer> {
        self.peers.remove(user)
    }

    /// Reconcile with an authoritative user list.
    pub fn sync_user_list(&mut self, peers: &[String], colors: &BTreeMap<String, PeerColor>) -> PeerChanges {
        let mut changes = PeerChanges::default();

        let gone: Vec<String> = self
            .peers
            .keys()
            .filter(|known| !peers.contains(known))
            .cloned()
            .collect();
        for user in gone {
            self.peers.remove(&user);
            changes.left.push(user);
        }

        for user in peers {
            let color = colors
                .get(user)
                .copied()
                .unwrap_or_else(|| PeerColor::from_user(user));
            if self.add_peer(user, color) {
                changes.joined.push(user.clone());
            }
        }

        changes
    }

    /// Record a remote cursor and return the marker to draw.
    ///
    /// Our own echo yields `None`. A cursor from an unknown peer creates a
    /// placeholder with a derived color.
    pub fn handle_cursor(&mut self, user: &str, position: Position) -> Option<CursorMarker> {
        if user == self.local_user {
            return None;
        }
        let peer = self
            .peers
            .entry(user.to_owned())
            .or_insert_with(|| RemotePeer::new(user, PeerColor::from_user(user)));
        peer.update_cursor(position);
        peer.marker()
    }

    /// Update the local cursor; returns a message unless throttled.
    pub fn update_local_cursor(&mut self, position: Position) -> Option<ClientMessage> {
        self.local_cursor = position;

        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_broadcast_interval {
                return None;
            }
        }

        Some(self.force_cursor_broadcast())
    }

    /// Emit the local cursor regardless of the rate limit.
    pub fn force_cursor_broadcast(&mut self) -> ClientMessage {
        self.last_cursor_broadcast = Some(Instant::now());
        ClientMessage::Cursor {
            user: self.local_user.clone(),
            position: self.local_cursor,
        }
    }

    /// Markers for every peer with a known cursor.
    pub fn markers(&self) -> Vec<CursorMarker> {
        self.peers.values().filter_map(RemotePeer::marker).collect()
    }

    pub fn peer(&self, user: &str) -> Option<&RemotePeer> {
        self.peers.get(user)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn local_cursor(&self) -> Position {
        self.local_cursor
    }
}
