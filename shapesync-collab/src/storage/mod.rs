//! Snapshot storage backends.
//!
//! A document is persisted as one key: `doc_id → encoded full store`. Every
//! save overwrites the previous blob atomically, so a reader only ever sees
//! a complete snapshot.
//!
//! ```text
//! ┌──────────────────┐   encode_full()   ┌───────────────────────────────┐
//! │ PersistenceStore │ ────────────────► │ SnapshotBackend               │
//! │ (writer task)    │                   │  ├── RocksBackend (RocksDB)   │
//! └──────────────────┘                   │  │     CF "documents" (LZ4)   │
//!                                        │  │     CF "metadata"          │
//!                                        │  └── MemoryBackend (tests)    │
//!                                        └───────────────────────────────┘
//! ```

use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{DocumentMetadata, RocksBackend, StoreConfig};

/// Storage errors. Never fatal to an editing session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Durable `doc_id → snapshot` key-value store.
///
/// Calls block; async callers run them on `spawn_blocking`.
pub trait SnapshotBackend: Send + Sync {
    /// The last stored snapshot, or `None` if the document was never saved.
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically replace the stored snapshot.
    fn store(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StorageError>;

    /// Short backend name for log lines.
    fn name(&self) -> &'static str;
}
