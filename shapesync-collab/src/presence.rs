//! Ephemeral presence: who is here, where their cursor is, what they selected.
//!
//! Presence never touches the shape store and is never persisted. Entries
//! travel on the transport's ephemeral channel and expire on their own when
//! a peer stops heart-beating.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_local()
//!       │  (cursor-only moves rate-limited: 30fps)
//!       ▼
//! PresenceMessage::Update(entry)
//!       │
//!       ▼   (ephemeral channel)
//! Remote PresenceTracker::handle_message()
//!       │
//!       ▼
//! remote_snapshot()   (entries older than ttl filtered out)
//! ```
//!
//! Expiry is measured with the receiver's own clock (`last_seen`), so a
//! peer with a skewed wall clock still expires correctly.

use serde::{Deserialize, Serialize};
use shapesync_core::ShapeId;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// One editing session (one tab, one window).
pub type SessionId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a session id (HSL, fixed S and L).
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
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
    match t {
        t if t < 1.0 / 6.0 => p + (q - p) * 6.0 * t,
        t if t < 1.0 / 2.0 => q,
        t if t < 2.0 / 3.0 => p + (q - p) * (2.0 / 3.0 - t) * 6.0,
        _ => p,
    }
}

/// Everything other sessions see about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: SessionId,
    pub user_id: String,
    pub display_name: String,
    pub color: CursorColor,
    pub cursor: Option<Point>,
    pub active_tool: Option<String>,
    pub selection: Vec<ShapeId>,
    /// Sender's wall clock (ms since epoch), strictly increasing per session
    pub timestamp: u64,
}

impl PresenceEntry {
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
            color: CursorColor::from_uuid(session_id),
            cursor: None,
            active_tool: None,
            selection: Vec::new(),
            timestamp: 0,
        }
    }
}

/// Partial change to the local entry. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub cursor: Option<Option<Point>>,
    pub active_tool: Option<Option<String>>,
    pub selection: Option<Vec<ShapeId>>,
    pub display_name: Option<String>,
}

impl PresenceUpdate {
    pub fn cursor(position: Point) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn hide_cursor() -> Self {
        Self {
            cursor: Some(None),
            ..Self::default()
        }
    }

    pub fn selection(ids: Vec<ShapeId>) -> Self {
        Self {
            selection: Some(ids),
            ..Self::default()
        }
    }

    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            active_tool: Some(Some(tool.into())),
            ..Self::default()
        }
    }

    pub fn with_selection(mut self, ids: Vec<ShapeId>) -> Self {
        self.selection = Some(ids);
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Moves the cursor and nothing else.
    pub fn is_cursor_only(&self) -> bool {
        self.cursor.is_some()
            && self.active_tool.is_none()
            && self.selection.is_none()
            && self.display_name.is_none()
    }

    /// Fold a later update into this one; later fields win.
    pub fn merge(&mut self, later: PresenceUpdate) {
        if later.cursor.is_some() {
            self.cursor = later.cursor;
        }
        if later.active_tool.is_some() {
            self.active_tool = later.active_tool;
        }
        if later.selection.is_some() {
            self.selection = later.selection;
        }
        if later.display_name.is_some() {
            self.display_name = later.display_name;
        }
    }

    fn apply_to(self, entry: &mut PresenceEntry) {
        if let Some(cursor) = self.cursor {
            entry.cursor = cursor;
        }
        if let Some(tool) = self.active_tool {
            entry.active_tool = tool;
        }
        if let Some(selection) = self.selection {
            entry.selection = selection;
        }
        if let Some(name) = self.display_name {
            entry.display_name = name;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Presence messages on the ephemeral channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// Full current entry (updates and heartbeats alike).
    Update(PresenceEntry),
    /// Clean departure. `timestamp` orders it against the sender's updates.
    Leave { session_id: SessionId, timestamp: u64 },
}

impl PresenceMessage {
    pub fn session_id(&self) -> SessionId {
        match self {
            PresenceMessage::Update(entry) => entry.session_id,
            PresenceMessage::Leave { session_id, .. } => *session_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    /// Remote entries not heard from for this long are gone
    pub ttl: Duration,
    /// Re-broadcast interval for the local entry; well below `ttl`
    pub heartbeat_interval: Duration,
    /// Minimum spacing of cursor-only publishes (33ms = 30fps)
    pub min_publish_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            min_publish_interval: Duration::from_millis(33),
        }
    }
}

#[derive(Debug, Clone)]
struct RemotePeer {
    entry: PresenceEntry,
    last_seen: Instant,
}

/// A clean departure, kept for one TTL to reject updates reordered behind it.
#[derive(Debug, Clone, Copy)]
struct Departure {
    timestamp: u64,
    at: Instant,
}

/// Presence state for one connected session.
///
/// Lives exactly as long as the connection: created on connect, dropped on
/// disconnect.
#[derive(Debug)]
pub struct PresenceTracker {
    local: PresenceEntry,
    peers: HashMap<SessionId, RemotePeer>,
    departed: HashMap<SessionId, Departure>,
    config: PresenceConfig,
    last_publish: Option<Instant>,
    /// Cursor-only change held back by the rate limit
    pending: bool,
}

impl PresenceTracker {
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            local: PresenceEntry::new(session_id, user_id, display_name),
            peers: HashMap::new(),
            departed: HashMap::new(),
            config,
            last_publish: None,
            pending: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.local.session_id
    }

    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Whether a throttled cursor move is still unpublished.
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Merge a partial update into the local entry.
    ///
    /// Returns the message to publish, or `None` if a cursor-only move was
    /// throttled (it goes out with the next publish).
    pub fn update_local(&mut self, update: PresenceUpdate) -> Option<PresenceMessage> {
        let cursor_only = update.is_cursor_only();
        update.apply_to(&mut self.local);

        if cursor_only {
            if let Some(last) = self.last_publish {
                if last.elapsed() < self.config.min_publish_interval {
                    log::trace!("Cursor update throttled");
                    self.pending = true;
                    return None;
                }
            }
        }
        Some(self.publish())
    }

    /// Unconditional re-broadcast of the local entry.
    pub fn heartbeat(&mut self) -> PresenceMessage {
        self.publish()
    }

    /// Removal broadcast for a clean disconnect; stamped after every update
    /// this tracker published.
    pub fn leave_message(&self) -> PresenceMessage {
        PresenceMessage::Leave {
            session_id: self.local.session_id,
            timestamp: now_millis().max(self.local.timestamp + 1),
        }
    }

    /// Apply a message from a peer. Returns whether the remote view changed.
    pub fn handle_message(&mut self, msg: &PresenceMessage) -> bool {
        if msg.session_id() == self.local.session_id {
            return false;
        }
        match msg {
            PresenceMessage::Update(entry) => {
                if let Some(departure) = self.departed.get(&entry.session_id) {
                    if entry.timestamp < departure.timestamp {
                        log::trace!("Presence from departed {} ignored", entry.session_id);
                        return false;
                    }
                    self.departed.remove(&entry.session_id);
                }
                if let Some(existing) = self.peers.get(&entry.session_id) {
                    if entry.timestamp < existing.entry.timestamp {
                        log::trace!("Stale presence from {} ignored", entry.session_id);
                        return false;
                    }
                }
                if !self.peers.contains_key(&entry.session_id) {
                    log::debug!("Presence: {} joined", entry.display_name);
                }
                self.peers.insert(
                    entry.session_id,
                    RemotePeer {
                        entry: entry.clone(),
                        last_seen: Instant::now(),
                    },
                );
                true
            }
            PresenceMessage::Leave {
                session_id,
                timestamp,
            } => {
                if let Some(existing) = self.peers.get(session_id) {
                    if existing.entry.timestamp > *timestamp {
                        log::trace!("Stale leave from {session_id} ignored");
                        return false;
                    }
                }
                let known = self.departed.get(session_id).map_or(0, |d| d.timestamp);
                if *timestamp >= known {
                    self.departed.insert(
                        *session_id,
                        Departure {
                            timestamp: *timestamp,
                            at: Instant::now(),
                        },
                    );
                }
                let removed = self.peers.remove(session_id).is_some();
                if removed {
                    log::debug!("Presence: {session_id} left");
                }
                removed
            }
        }
    }

    /// Live remote entries. Never contains the local session.
    pub fn remote_snapshot(&self) -> HashMap<SessionId, PresenceEntry> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() < self.config.ttl)
            .map(|(id, peer)| (*id, peer.entry.clone()))
            .collect()
    }

    /// Drop expired entries and return their ids.
    pub fn prune_expired(&mut self) -> Vec<SessionId> {
        let ttl = self.config.ttl;
        let expired: Vec<SessionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
            log::debug!("Presence: {id} expired");
        }
        self.departed.retain(|_, departure| departure.at.elapsed() < ttl);
        expired
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn publish(&mut self) -> PresenceMessage {
        self.local.timestamp = now_millis().max(self.local.timestamp + 1);
        self.last_publish = Some(Instant::now());
        self.pending = false;
        PresenceMessage::Update(self.local.clone())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
