//! Persistence integration tests.
//!
//! Verifies:
//! - Snapshot save/restore through RocksDB across coordinator restarts
//! - Restore completes before any peer traffic
//! - Corrupt or unreadable storage never blocks editing
//! - Debounced flush coalesces bursts and honours the max delay

use std::sync::Arc;

use shapesync_collab::coordinator::{
    CoordinatorConfig, CoordinatorError, FlushPolicy, SyncCoordinator, ToolResult,
};
use shapesync_collab::persistence::{PersistenceStore, RestoreOutcome};
use shapesync_collab::storage::{MemoryBackend, RocksBackend, StoreConfig};
use shapesync_collab::transport::{ConnectionStatus, LocalHub};
use shapesync_core::{FieldKey, Shape, ShapeId, ShapeStore};
use tempfile::tempdir;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn rect(id: u128, x: f64) -> Shape {
    Shape::new(ShapeId::from_u128(id))
        .with(FieldKey::geometry("x"), x)
        .with(FieldKey::style("fill"), "#00ff00")
}

fn with_memory(replica: &str, doc: Uuid, backend: Arc<MemoryBackend>) -> SyncCoordinator {
    let config = CoordinatorConfig::new(doc).with_replica(replica);
    SyncCoordinator::start(config, PersistenceStore::with_backend(doc, backend))
}

/// Poll until the backend saw `count` successful writes. Paused clocks
/// auto-advance while the blocking save runs.
async fn wait_for_writes(backend: &MemoryBackend, count: usize) {
    for _ in 0..200 {
        if backend.write_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("expected {count} writes, saw {}", backend.write_count());
}

// ─── RocksDB roundtrip ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_restores_document() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    let first = SyncCoordinator::start(
        CoordinatorConfig::new(doc).with_replica("a"),
        PersistenceStore::open(doc, StoreConfig::for_testing(&path)),
    );
    assert_eq!(first.restore_outcome().await.unwrap(), RestoreOutcome::Empty);
    first.apply(ToolResult::Create(rect(1, 1.0))).unwrap();
    first.apply(ToolResult::Create(rect(2, 2.0))).unwrap();
    first.apply(ToolResult::Delete(ShapeId::from_u128(2))).unwrap();
    first.sync().await.unwrap();
    let before = first.snapshot();
    first.shutdown().await.unwrap();

    let second = SyncCoordinator::start(
        CoordinatorConfig::new(doc).with_replica("a"),
        PersistenceStore::open(doc, StoreConfig::for_testing(&path)),
    );
    assert_eq!(second.restore_outcome().await.unwrap(), RestoreOutcome::Restored { shapes: 1 });
    assert_eq!(second.snapshot(), before);

    // The deleted shape kept its fields behind the tombstone.
    second.restore_shape(ShapeId::from_u128(2)).unwrap();
    second.sync().await.unwrap();
    let revived = second.snapshot();
    assert_eq!(
        revived.get(&ShapeId::from_u128(2)).unwrap().get(&FieldKey::geometry("x")),
        Some(&2.0.into())
    );
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_overwrites_single_key() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    let backend = RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let mut store = ShapeStore::new("a");
    for i in 0..5 {
        store
            .apply_local_write(ShapeId::from_u128(i), [(FieldKey::geometry("x"), 1.0.into())]);
        backend.save_snapshot(doc, &store.encode_full().unwrap()).unwrap();
    }

    assert_eq!(backend.load_metadata(doc).unwrap().version, 5);
    let restored = ShapeStore::decode_full("b", &backend.load_snapshot(doc).unwrap()).unwrap();
    assert_eq!(restored.snapshot(), store.snapshot());
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();
    {
        let backend = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
        backend.save_snapshot(doc, b"definitely not a delta").unwrap();
    }

    let coordinator = SyncCoordinator::start(
        CoordinatorConfig::new(doc),
        PersistenceStore::open(doc, StoreConfig::for_testing(&path)),
    );
    assert_eq!(coordinator.restore_outcome().await.unwrap(), RestoreOutcome::Corrupt);
    assert!(coordinator.snapshot().is_empty());

    // Next save replaces the corrupt blob.
    coordinator.apply(ToolResult::Create(rect(1, 1.0))).unwrap();
    coordinator.flushed().await.unwrap();
    coordinator.shutdown().await.unwrap();

    let backend = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
    let restored = ShapeStore::decode_full("x", &backend.load_snapshot(doc).unwrap()).unwrap();
    assert_eq!(restored.len(), 1);
}

// ─── Restore ordering ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restore_precedes_connect() {
    let hub = LocalHub::new(64);
    let doc = Uuid::new_v4();

    let mut saved = ShapeStore::new("b");
    saved
        .apply_local_write(ShapeId::from_u128(42), [(FieldKey::geometry("x"), 4.0.into())]);
    let backend = Arc::new(MemoryBackend::with_snapshot(doc, saved.encode_full().unwrap()));

    let a = with_memory("a", doc, Arc::new(MemoryBackend::new()));
    a.connect(Arc::new(hub.transport())).unwrap();

    // Connect is queued behind the restore, so the restored shape is part of
    // b's very first handshake.
    let b = with_memory("b", doc, backend);
    b.connect(Arc::new(hub.transport())).unwrap();
    assert_eq!(b.restore_outcome().await.unwrap(), RestoreOutcome::Restored { shapes: 1 });

    let mut rx = a.subscribe();
    timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.contains(&ShapeId::from_u128(42))),
    )
    .await
    .unwrap()
    .unwrap();
}

// ─── Degraded storage ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_storage_failure_degrades_without_blocking() {
    let doc = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_fail_writes(true);
    // Only explicit flushes in this test.
    let config = CoordinatorConfig::new(doc).with_flush(FlushPolicy {
        debounce: Duration::from_secs(600),
        max_delay: Duration::from_secs(600),
    });
    let coordinator =
        SyncCoordinator::start(config, PersistenceStore::with_backend(doc, backend.clone()));

    for i in 0..3 {
        coordinator.apply(ToolResult::Create(rect(i, 1.0))).unwrap();
        assert!(matches!(
            coordinator.flushed().await,
            Err(CoordinatorError::Storage(_))
        ));
    }

    // Memory-only from here on: flushes succeed, nothing reaches the backend.
    backend.set_fail_writes(false);
    coordinator.apply(ToolResult::Create(rect(9, 1.0))).unwrap();
    coordinator.flushed().await.unwrap();
    assert_eq!(backend.write_count(), 0);
    assert_eq!(coordinator.snapshot().len(), 4);
}

#[tokio::test]
async fn test_unreadable_storage_starts_memory_only() {
    let doc = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_fail_reads(true);
    let coordinator = with_memory("a", doc, backend.clone());

    assert_eq!(coordinator.restore_outcome().await.unwrap(), RestoreOutcome::Unavailable);
    coordinator.apply(ToolResult::Create(rect(1, 1.0))).unwrap();
    coordinator.flushed().await.unwrap();
    assert_eq!(backend.write_count(), 0);
    assert_eq!(coordinator.status(), ConnectionStatus::Disconnected);
}

// ─── Debounced flushing ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_debounce_coalesces_burst() {
    let doc = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());
    let coordinator = with_memory("a", doc, backend.clone());

    for i in 0..5 {
        coordinator.apply(ToolResult::Create(rect(i, 1.0))).unwrap();
        coordinator.sync().await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
    }
    assert_eq!(backend.write_count(), 0);

    tokio::time::advance(Duration::from_millis(500)).await;
    wait_for_writes(&backend, 1).await;
    assert_eq!(backend.write_count(), 1);

    let stored = ShapeStore::decode_full("r", &backend.snapshot(doc).unwrap()).unwrap();
    assert_eq!(stored.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_edits_flush_at_max_delay() {
    let doc = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());
    let config = CoordinatorConfig::new(doc).with_flush(FlushPolicy {
        debounce: Duration::from_millis(500),
        max_delay: Duration::from_millis(1800),
    });
    let coordinator =
        SyncCoordinator::start(config, PersistenceStore::with_backend(doc, backend.clone()));

    // One edit every 400ms never lets the debounce expire.
    for i in 0..5 {
        if i > 0 {
            tokio::time::advance(Duration::from_millis(400)).await;
        }
        coordinator
            .write_fields(ShapeId::from_u128(1), [(FieldKey::geometry("x"), (i as f64).into())])
            .unwrap();
        coordinator.sync().await.unwrap();
    }
    assert_eq!(backend.write_count(), 0);

    // Past the max delay, still inside the last debounce window.
    tokio::time::advance(Duration::from_millis(250)).await;
    wait_for_writes(&backend, 1).await;
}

#[tokio::test]
async fn test_shutdown_flushes_pending_edits() {
    let doc = Uuid::new_v4();
    let backend = Arc::new(MemoryBackend::new());
    let coordinator = with_memory("a", doc, backend.clone());

    coordinator.apply(ToolResult::Create(rect(1, 1.0))).unwrap();
    coordinator.shutdown().await.unwrap();

    assert_eq!(backend.write_count(), 1);
    let stored = ShapeStore::decode_full("r", &backend.snapshot(doc).unwrap()).unwrap();
    assert_eq!(stored.snapshot(), coordinator.snapshot());
}
