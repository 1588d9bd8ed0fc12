//! Durable storage for encoded document state.
//!
//! - [`Persistence`] — the load/save contract the engine depends on
//! - [`rocks`] — RocksDB-backed store (LZ4 state blobs + metadata)
//! - [`MemoryStore`] — in-process store for tests and storage-less runs
//!
//! Each document id maps to one blob (the encoded replicated state) plus a
//! last-modified timestamp. A save overwrites both atomically.

pub mod rocks;

pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::error::StoreError;

/// Load/save contract for persisted document state.
///
/// Calls are blocking; the engine runs them on the blocking thread pool.
pub trait Persistence: Send + Sync {
    /// Load the last saved state for a document, if any.
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace the stored state for a document.
    fn save(&self, document_id: &str, state: &[u8], timestamp: SystemTime) -> Result<(), StoreError>;
}

/// In-memory [`Persistence`] backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (Vec<u8>, SystemTime)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-modified timestamp of a stored document.
    pub fn updated_at(&self, document_id: &str) -> Option<SystemTime> {
        self.entries
            .read()
            .ok()?
            .get(document_id)
            .map(|(_, at)| *at)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(entries.get(document_id).map(|(state, _)| state.clone()))
    }

    fn save(&self, document_id: &str, state: &[u8], timestamp: SystemTime) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Task(e.to_string()))?;
        entries.insert(document_id.to_string(), (state.to_vec(), timestamp));
        Ok(())
    }
}
