//! Durable local snapshots of one document.
//!
//! ```text
//! start ──▶ PersistenceStore::restore(ShapeStore)     (spawn_blocking: open + initialize)
//!             │
//!             ▼
//!          PersistenceWriter::spawn(store)
//!             │  save(encode_full()) … save(…)   (from the coordinator)
//!             ▼
//!          writer task ── spawn_blocking ──▶ SnapshotBackend::store
//! ```
//!
//! Storage trouble never stops editing: a failing backend is reported with
//! a warning and, after repeated failures, dropped for the rest of the
//! session (memory-only mode).

use std::sync::Arc;

use shapesync_core::ShapeStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{RocksBackend, SnapshotBackend, StorageError, StoreConfig};

/// Failed saves in a row before the backend is abandoned.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Result of [`PersistenceStore::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Snapshot merged; `shapes` visible shapes afterwards
    Restored { shapes: usize },
    /// Nothing stored yet
    Empty,
    /// Stored blob did not decode; starting empty
    Corrupt,
    /// No usable backend; memory-only
    Unavailable,
}

pub struct PersistenceStore {
    doc_id: Uuid,
    backend: Option<Arc<dyn SnapshotBackend>>,
    /// RocksDB location, opened by `initialize`
    pending: Option<StoreConfig>,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl PersistenceStore {
    /// RocksDB at `config.path`.
    ///
    /// Does no I/O: the database is opened by [`initialize`](Self::initialize),
    /// and a database that cannot be opened leaves the store memory-only.
    pub fn open(doc_id: Uuid, config: StoreConfig) -> Self {
        Self {
            pending: Some(config),
            ..Self::memory_only(doc_id)
        }
    }

    pub fn with_backend(doc_id: Uuid, backend: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            doc_id,
            backend: Some(backend),
            pending: None,
            consecutive_failures: 0,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    pub fn memory_only(doc_id: Uuid) -> Self {
        Self {
            doc_id,
            backend: None,
            pending: None,
            consecutive_failures: 0,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max.max(1);
        self
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Whether saves reach a backend. A not yet opened database counts.
    pub fn is_durable(&self) -> bool {
        self.backend.is_some() || self.pending.is_some()
    }

    pub fn backend_name(&self) -> &'static str {
        match (&self.backend, &self.pending) {
            (Some(backend), _) => backend.name(),
            (None, Some(_)) => "rocksdb",
            (None, None) => "none",
        }
    }

    /// Open the configured database (if any) and merge the stored snapshot
    /// into `store`. Blocking; see [`restore`](Self::restore).
    ///
    /// Runs before the store is shared with anything else. A corrupt blob is
    /// rejected as a whole; a failing backend switches to memory-only mode.
    pub fn initialize(&mut self, store: &mut ShapeStore) -> RestoreOutcome {
        if let Some(config) = self.pending.take() {
            match RocksBackend::open(config) {
                Ok(backend) => self.backend = Some(Arc::new(backend)),
                Err(e) => log::warn!(
                    "Snapshot store unavailable ({e}), continuing in memory-only mode"
                ),
            }
        }

        let Some(backend) = &self.backend else {
            log::info!("No snapshot store for {}, starting empty", self.doc_id);
            return RestoreOutcome::Unavailable;
        };

        match backend.load(self.doc_id) {
            Ok(None) => {
                log::info!("No snapshot for {}, starting empty", self.doc_id);
                RestoreOutcome::Empty
            }
            Ok(Some(bytes)) => match store.merge_full(&bytes) {
                Ok(report) => {
                    log::info!(
                        "Restored {} ({} writes, {} shapes) from {}",
                        self.doc_id,
                        report.applied,
                        store.len(),
                        backend.name()
                    );
                    RestoreOutcome::Restored {
                        shapes: store.len(),
                    }
                }
                Err(e) => {
                    log::warn!("Stored snapshot of {} is corrupt ({e}), starting empty", self.doc_id);
                    RestoreOutcome::Corrupt
                }
            },
            Err(e) => {
                log::warn!(
                    "Failed to load snapshot of {} ({e}), continuing in memory-only mode",
                    self.doc_id
                );
                self.backend = None;
                RestoreOutcome::Unavailable
            }
        }
    }

    /// [`initialize`](Self::initialize) on the blocking pool, so the caller's
    /// runtime thread never waits on disk.
    pub async fn restore(self, store: ShapeStore) -> (Self, ShapeStore, RestoreOutcome) {
        let doc_id = self.doc_id;
        let replica = store.replica().clone();
        let task = tokio::task::spawn_blocking(move || {
            let (mut persistence, mut store) = (self, store);
            let outcome = persistence.initialize(&mut store);
            (persistence, store, outcome)
        });

        match task.await {
            Ok(restored) => restored,
            Err(e) => {
                log::warn!("Restore of {doc_id} failed ({e}), continuing in memory-only mode");
                (
                    Self::memory_only(doc_id),
                    ShapeStore::new(replica),
                    RestoreOutcome::Unavailable,
                )
            }
        }
    }

    /// Overwrite the stored snapshot. Runs the blocking write off the runtime.
    pub async fn save(&mut self, snapshot: Vec<u8>) -> Result<(), StorageError> {
        let Some(backend) = self.backend.clone() else {
            log::trace!("Memory-only mode, snapshot of {} not persisted", self.doc_id);
            return Ok(());
        };

        let doc_id = self.doc_id;
        let result = tokio::task::spawn_blocking(move || backend.store(doc_id, &snapshot))
            .await
            .unwrap_or_else(|e| Err(StorageError::Io(format!("save task failed: {e}"))));

        match &result {
            Ok(()) => self.consecutive_failures = 0,
            Err(e) => {
                self.consecutive_failures += 1;
                log::warn!(
                    "Failed to persist {} ({e}), attempt {}/{}",
                    self.doc_id,
                    self.consecutive_failures,
                    self.max_consecutive_failures
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    log::warn!("Giving up on snapshot store, continuing in memory-only mode");
                    self.backend = None;
                }
            }
        }
        result
    }
}

pub type SaveAck = oneshot::Receiver<Result<(), StorageError>>;

struct SaveJob {
    snapshot: Vec<u8>,
    ack: Option<oneshot::Sender<Result<(), StorageError>>>,
}

/// Background task that owns a [`PersistenceStore`] and applies saves in
/// submission order.
///
/// Jobs that pile up while a write is in flight are coalesced: only the
/// newest snapshot is written, and every waiter gets its result.
pub struct PersistenceWriter {
    jobs: mpsc::UnboundedSender<SaveJob>,
    task: JoinHandle<PersistenceStore>,
}

impl PersistenceWriter {
    pub fn spawn(store: PersistenceStore) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(store, rx));
        Self { jobs, task }
    }

    /// Queue a snapshot; returns immediately.
    pub fn save(&self, snapshot: Vec<u8>) {
        self.submit(snapshot, None);
    }

    /// Queue a snapshot and get notified once it was written (or failed).
    pub fn save_with_ack(&self, snapshot: Vec<u8>) -> SaveAck {
        let (tx, rx) = oneshot::channel();
        self.submit(snapshot, Some(tx));
        rx
    }

    pub(crate) fn submit(
        &self,
        snapshot: Vec<u8>,
        ack: Option<oneshot::Sender<Result<(), StorageError>>>,
    ) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(SaveJob { snapshot, ack }) {
            log::warn!("Persistence writer stopped, snapshot dropped");
            if let Some(ack) = job.ack {
                let _ = ack.send(Err(StorageError::Io("writer stopped".into())));
            }
        }
    }

    /// Finish outstanding saves and hand the store back.
    pub async fn close(self) -> Option<PersistenceStore> {
        drop(self.jobs);
        self.task.await.ok()
    }
}

async fn run_writer(
    mut store: PersistenceStore,
    mut jobs: mpsc::UnboundedReceiver<SaveJob>,
) -> PersistenceStore {
    while let Some(job) = jobs.recv().await {
        let mut snapshot = job.snapshot;
        let mut acks: Vec<_> = job.ack.into_iter().collect();
        while let Ok(newer) = jobs.try_recv() {
            snapshot = newer.snapshot;
            acks.extend(newer.ack);
        }

        let result = store.save(snapshot).await;
        for ack in acks {
            let _ = ack.send(result.clone());
        }
    }
    store
}
