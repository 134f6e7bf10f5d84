//! # shapesync-collab: sync, persistence and presence for shapesync
//!
//! Wires a [`shapesync_core::ShapeStore`] to peers, to disk and to the
//! people looking at the same canvas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  TransportEvent   ┌──────────────────┐
//! │ SyncCoordinator  │ ◄──────────────── │ Transport        │
//! │ (actor, owns the │ ────────────────► │ LocalHub / WS /  │
//! │  ShapeStore)     │  opaque bytes     │ Noop             │
//! └───┬──────────┬───┘                   └────────┬─────────┘
//!     │          │                                │ WebSocket
//!     ▼          ▼                                ▼
//! ┌────────┐ ┌──────────────────┐         ┌──────────────────┐
//! │Presence│ │ PersistenceStore │         │ RelayServer      │
//! │Tracker │ │ (RocksDB / mem)  │         │ (stateless)      │
//! └────────┘ └──────────────────┘         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: actor owning the store; commands, handshake, flushing
//! - [`protocol`]: binary envelopes (`SyncMessage`, `Frame`)
//! - [`transport`]: `Transport` port and its implementations
//! - [`relay`]: WebSocket fan-out relay
//! - [`presence`]: cursors, selections, TTL expiry
//! - [`persistence`]: restore on start, ordered background saves
//! - [`storage`]: snapshot backends (RocksDB, memory)

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod coordinator;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod transport;

pub use coordinator::{CoordinatorConfig, CoordinatorError, FlushPolicy, SyncCoordinator, ToolResult};
pub use persistence::{PersistenceStore, PersistenceWriter, RestoreOutcome};
pub use presence::{
    CursorColor, Point, PresenceConfig, PresenceEntry, PresenceMessage, PresenceTracker,
    PresenceUpdate, SessionId,
};
pub use protocol::{Channel, Frame, MessageType, ProtocolError, SyncMessage};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use storage::{MemoryBackend, RocksBackend, SnapshotBackend, StorageError, StoreConfig};
pub use transport::{
    ConnectionStatus, LocalHub, LocalTransport, NoopTransport, OutboundQueue, ReconnectPolicy,
    Transport, TransportError, TransportEvent, WebSocketTransport,
};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
