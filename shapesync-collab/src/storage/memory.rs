//! In-memory backend with switchable failures, for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use super::{SnapshotBackend, StorageError};
use crate::lock;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    load_delay: Mutex<Duration>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded with one snapshot.
    pub fn with_snapshot(doc_id: Uuid, snapshot: Vec<u8>) -> Self {
        let backend = Self::new();
        lock(&backend.snapshots).insert(doc_id, snapshot);
        backend
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every `load` block the calling thread for `delay`.
    pub fn set_load_delay(&self, delay: Duration) {
        *lock(&self.load_delay) = delay;
    }

    /// Successful saves so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        lock(&self.snapshots).get(&doc_id).cloned()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected read failure".into()));
        }
        let delay = *lock(&self.load_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(lock(&self.snapshots).get(&doc_id).cloned())
    }

    fn store(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected write failure".into()));
        }
        lock(&self.snapshots).insert(doc_id, snapshot.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        assert_eq!(backend.load(id).unwrap(), None);

        backend.store(id, b"abc").unwrap();
        assert_eq!(backend.load(id).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(backend.write_count(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let id = Uuid::new_v4();
        let backend = MemoryBackend::with_snapshot(id, vec![1]);

        backend.set_fail_reads(true);
        assert!(backend.load(id).is_err());
        backend.set_fail_writes(true);
        assert!(backend.store(id, b"new").is_err());
        assert_eq!(backend.write_count(), 0);

        backend.set_fail_reads(false);
        assert_eq!(backend.load(id).unwrap(), Some(vec![1]));
    }
}
