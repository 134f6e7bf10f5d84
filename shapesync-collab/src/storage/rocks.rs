//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: full store snapshots (LZ4 compressed), keyed by doc id
//! - `metadata` : per-document bookkeeping (bincode), keyed by doc id
//!
//! A save writes both families in one `WriteBatch`, so snapshot and metadata
//! never disagree after a crash.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{SnapshotBackend, StorageError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every save (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shapesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Number of saves so far
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_secs();
        Self {
            doc_id,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        // Snapshots are LZ4 compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the snapshot of `doc_id` (LZ4 compressed) and bump its metadata.
    pub fn save_snapshot(
        &self,
        doc_id: Uuid,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot v{} of {doc_id}: {} → {} bytes",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load the snapshot of `doc_id` (LZ4 decompressed).
    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Err(StorageError::NotFound(doc_id)),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StorageError::NotFound(doc_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }
}

impl SnapshotBackend for RocksBackend {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        match self.load_snapshot(doc_id) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StorageError> {
        self.save_snapshot(doc_id, snapshot).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "rocksdb"
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let data = b"full store snapshot bytes".to_vec();

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);

        assert_eq!(store.load_snapshot(doc_id).unwrap(), data);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        assert_eq!(store.load_snapshot(doc_id), Err(StorageError::NotFound(doc_id)));
        assert_eq!(store.load(doc_id).unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_and_versions() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();

        store.store(doc_id, b"first").unwrap();
        store.store(doc_id, b"second").unwrap();

        assert_eq!(store.load(doc_id).unwrap().as_deref(), Some(&b"second"[..]));
        let meta = store.load_metadata(doc_id).unwrap();
        assert_eq!(meta.version, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let data = vec![7u8; 64 * 1024];

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        assert!(meta.compressed_size * 10 < meta.snapshot_size);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), data);
    }

    #[test]
    fn test_reopen_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc_id = Uuid::new_v4();
        {
            let store = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
            store.store(doc_id, b"durable").unwrap();
        }
        let store = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load(doc_id).unwrap().as_deref(), Some(&b"durable"[..]));
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("shapesync_data"));
        assert!(!config.sync_writes);
    }
}
