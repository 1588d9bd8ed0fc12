//! RocksDB-backed document state store.
//!
//! Column families:
//! - `documents` — encoded Yrs document state (LZ4 compressed), keyed by document id
//! - `metadata`  — per-document metadata (bincode: sizes, created/updated timestamps)
//!
//! State and metadata are written in one `WriteBatch`, so a reader never sees
//! a new blob with stale metadata or the reverse.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

use super::Persistence;
use crate::error::StoreError;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true — writes are already debounced)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Document metadata stored alongside the state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Uncompressed state size in bytes
    pub state_size: u64,
    /// Compressed state size in bytes
    pub compressed_size: u64,
    /// First save (milliseconds since epoch)
    pub created_at: u64,
    /// Last save (milliseconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: &str, timestamp: u64) -> Self {
        Self {
            document_id: document_id.to_string(),
            state_size: 0,
            compressed_size: 0,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Milliseconds since the Unix epoch (0 for pre-epoch clocks).
pub(crate) fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 frames
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Save a document's full encoded state (LZ4 compressed) with its metadata.
    pub fn save_state(
        &self,
        document_id: &str,
        state: &[u8],
        timestamp: SystemTime,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let updated_at = epoch_millis(timestamp);

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id, updated_at));
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = updated_at;

        let key = document_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a document's encoded state (LZ4 decompressed).
    pub fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Load document metadata.
    pub fn metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Get a column family handle.
    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

impl Persistence for RocksStore {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_state(document_id)
    }

    fn save(&self, document_id: &str, state: &[u8], timestamp: SystemTime) -> Result<(), StoreError> {
        self.save_state(document_id, state, timestamp).map(|_| ())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = open_temp();
        let state = vec![7u8; 4096];

        store.save_state("B1", &state, SystemTime::now()).unwrap();
        assert_eq!(store.load_state("B1").unwrap(), Some(state));
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.load_state("missing").unwrap().is_none());
        assert!(store.metadata("missing").unwrap().is_none());
    }

    #[test]
    fn test_metadata_tracks_timestamps() {
        let (_dir, store) = open_temp();
        let first = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let second = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000);

        store.save_state("B1", b"one", first).unwrap();
        let meta = store.save_state("B1", b"two!", second).unwrap();

        assert_eq!(meta.created_at, 1_000_000);
        assert_eq!(meta.updated_at, 2_000_000);
        assert_eq!(meta.state_size, 4);
        assert_eq!(store.metadata("B1").unwrap(), Some(meta));
        assert_eq!(store.load_state("B1").unwrap().as_deref(), Some(&b"two!"[..]));
    }

    #[test]
    fn test_documents_isolated() {
        let (_dir, store) = open_temp();
        store.save_state("a", &[1], SystemTime::now()).unwrap();
        store.save_state("b", &[2], SystemTime::now()).unwrap();
        assert_eq!(store.load_state("a").unwrap(), Some(vec![1]));
        assert_eq!(store.load_state("b").unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_empty_state() {
        let (_dir, store) = open_temp();
        store.save_state("empty", &[], SystemTime::now()).unwrap();
        assert_eq!(store.load_state("empty").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_state("B1", b"durable", SystemTime::now()).unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_state("B1").unwrap().as_deref(), Some(&b"durable"[..]));
    }

    #[test]
    fn test_persistence_trait() {
        let (_dir, store) = open_temp();
        let backend: &dyn Persistence = &store;
        backend.save("B1", &[9, 9], SystemTime::now()).unwrap();
        assert_eq!(backend.load("B1").unwrap(), Some(vec![9, 9]));
    }
}
