//! Transport port: how a coordinator talks to its peers.
//!
//! A transport moves opaque bytes. It never decodes deltas, never touches
//! the shape store and never blocks the caller: sends are fire-and-forget,
//! and everything that happens on the wire comes back as a
//! [`TransportEvent`] on the channel handed to [`Transport::connect`].
//!
//! ```text
//!   coordinator ── send_update / send_ephemeral ──▶ transport ──▶ wire
//!        ▲                                              │
//!        └────────── TransportEvent (mpsc) ◀────────────┘
//! ```
//!
//! Implementations:
//! - [`local::LocalHub`]: in-process rooms (tests, same-process replicas)
//! - [`noop::NoopTransport`]: single-user mode
//! - [`websocket::WebSocketTransport`]: client of [`crate::relay::RelayServer`]

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::lock;

pub mod local;
pub mod noop;
pub mod queue;
pub mod websocket;

pub use local::{LocalHub, LocalTransport, RoomStats};
pub use noop::NoopTransport;
pub use queue::{OutboundQueue, DEFAULT_OUTBOUND_CAPACITY};
pub use websocket::{ReconnectPolicy, WebSocketTransport};

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, handshake in flight
    Syncing,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Syncing)
    }
}

/// Everything a transport reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Document-channel bytes from a peer
    Update(Vec<u8>),
    /// Presence-channel bytes from a peer
    Ephemeral(Vec<u8>),
    Status(ConnectionStatus),
    /// Inbound frames were lost; the owner should pull full state again
    Resync,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Transport errors. Never propagated into the edit path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Disconnect timed out")]
    Timeout,
}

/// Peer-to-peer byte pipe for one room.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join `room_id`. Status changes and inbound frames are reported on
    /// `events` until [`Transport::disconnect`].
    async fn connect(&self, room_id: &str, events: EventSender) -> Result<(), TransportError>;

    /// Leave the room, drop queued outbound updates and stop reporting events.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send document bytes; queued while not connected.
    fn send_update(&self, bytes: Vec<u8>);

    /// Send presence bytes; dropped while not connected.
    fn send_ephemeral(&self, bytes: Vec<u8>);

    fn status(&self) -> ConnectionStatus;
}

/// Status plus the owner's event channel. Shared by the transports so a
/// status change is always reported exactly once.
#[derive(Debug)]
pub(crate) struct Link {
    status: ConnectionStatus,
    events: Option<EventSender>,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            events: None,
        }
    }

    pub(crate) fn attach(&mut self, events: EventSender) {
        self.events = Some(events);
    }

    pub(crate) fn detach(&mut self) {
        self.set_status(ConnectionStatus::Disconnected);
        self.events = None;
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        log::debug!("Transport status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.emit(TransportEvent::Status(status));
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            // Owner gone: nothing left to notify.
            let _ = events.send(event);
        }
    }

    pub(crate) fn events(&self) -> Option<EventSender> {
        self.events.clone()
    }
}
