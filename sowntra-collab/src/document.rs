//! Replicated document store.
//!
//! One authoritative Yrs `Doc` per document id, created on first access and
//! seeded from persisted state when there is any. All mutation goes through
//! [`DocumentStore::merge`] (or [`DocumentGuard::apply`]), which holds the
//! document's lock for the duration of one Yrs transaction, so there is
//! exactly one writer per document at a time.
//!
//! ```text
//! join ──► get_or_create ──► load (blocking pool, once per id)
//!                                 │
//! update ─► merge ─► apply_update ┴─► DocumentChange ─► subscribers
//! ```
//!
//! Every successful merge emits exactly one [`DocumentChange`]. Documents stay
//! resident after their last session leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, Mutex, MutexGuard, OnceCell, RwLock};
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::error::{ProtocolError, StoreError};
use crate::storage::rocks::epoch_millis;
use crate::storage::Persistence;
use crate::update_check::check_update_v1;

/// Buffered change notifications per subscriber.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Notification emitted once per successful merge.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub document_id: Arc<str>,
    /// Document version after the merge.
    pub version: u64,
    /// The delta exactly as merged.
    pub delta: Arc<Vec<u8>>,
}

/// One live replicated document.
pub struct Document {
    id: Arc<str>,
    state: Mutex<yrs::Doc>,
    /// Incremented by every successful merge.
    version: AtomicU64,
    /// Highest version known to be durably written.
    persisted_version: AtomicU64,
    /// Milliseconds since epoch of the last successful write (0 = never).
    last_persisted: AtomicU64,
    /// Held across a whole write so an older snapshot never lands after a
    /// newer one. Separate from `state` so merges continue during I/O.
    write_serial: Mutex<()>,
}

impl Document {
    fn new(id: &str, doc: yrs::Doc) -> Self {
        Self {
            id: Arc::from(id),
            state: Mutex::new(doc),
            version: AtomicU64::new(0),
            persisted_version: AtomicU64::new(0),
            last_persisted: AtomicU64::new(0),
            write_serial: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether merges have happened since the last successful write.
    pub fn is_dirty(&self) -> bool {
        self.version() > self.persisted_version.load(Ordering::SeqCst)
    }

    /// Time of the last successful write, if any.
    pub fn last_persisted(&self) -> Option<SystemTime> {
        match self.last_persisted.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(ms)),
        }
    }

    /// Record that the state as of `version` was written at `at`.
    pub fn mark_persisted(&self, version: u64, at: SystemTime) {
        self.persisted_version.fetch_max(version, Ordering::SeqCst);
        self.last_persisted.store(epoch_millis(at).max(1), Ordering::SeqCst);
    }

    /// Serialize persistence writes of this document.
    pub async fn begin_write(&self) -> MutexGuard<'_, ()> {
        self.write_serial.lock().await
    }

    /// Take the document's write lock.
    pub async fn lock(&self) -> DocumentGuard<'_> {
        DocumentGuard {
            document: self,
            state: self.state.lock().await,
        }
    }

    /// Full state encoding.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.lock().await.snapshot()
    }

    /// Current state vector (which updates this replica has seen).
    pub async fn state_vector(&self) -> StateVector {
        let state = self.state.lock().await;
        let txn = state.transact();
        txn.state_vector()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Exclusive access to one document's state.
pub struct DocumentGuard<'a> {
    document: &'a Document,
    state: MutexGuard<'a, yrs::Doc>,
}

impl DocumentGuard<'_> {
    /// Encode the full state, enough for a fresh replica to reconstruct it.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.state.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a v1 update. Returns the new document version.
    ///
    /// The bytes are checked structurally before Yrs decodes them; a rejected
    /// delta leaves the document untouched.
    pub fn apply(&mut self, delta: &[u8]) -> Result<u64, ProtocolError> {
        check_update_v1(delta).map_err(|e| {
            log::debug!("Rejected delta for {}: {e}", self.document.id);
            ProtocolError::from(e)
        })?;
        let update = Update::decode_v1(delta).map_err(|_| ProtocolError::InvalidUpdate)?;
        {
            let mut txn = self.state.transact_mut();
            txn.apply_update(update).map_err(|_| ProtocolError::InvalidUpdate)?;
        }
        Ok(self.document.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn version(&self) -> u64 {
        self.document.version()
    }
}

/// Seed `doc` from persisted bytes. Unreadable state is logged and the
/// document starts empty.
fn restore(doc: &yrs::Doc, id: &str, bytes: &[u8]) {
    let decoded = check_update_v1(bytes)
        .map_err(|e| e.to_string())
        .and_then(|()| Update::decode_v1(bytes).map_err(|e| e.to_string()));
    let update = match decoded {
        Ok(update) => update,
        Err(e) => {
            log::warn!("Persisted state for {id} is not a valid update, starting empty: {e}");
            return;
        }
    };

    let applied = {
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
    };
    match applied {
        Ok(()) => log::info!("Loaded document {id} ({} bytes)", bytes.len()),
        Err(e) => log::warn!("Persisted state for {id} did not apply: {e}"),
    }
}

/// Owner of every live [`Document`].
pub struct DocumentStore {
    documents: RwLock<HashMap<String, Arc<OnceCell<Arc<Document>>>>>,
    persistence: Arc<dyn Persistence>,
    changes: broadcast::Sender<DocumentChange>,
}

impl DocumentStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            documents: RwLock::new(HashMap::new()),
            persistence,
            changes,
        }
    }

    /// Return the live document for `id`, loading it on first access.
    ///
    /// Concurrent callers for a cold id share one load. A failed load is not
    /// cached, so the next caller retries it.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Document>, StoreError> {
        let cell = {
            let documents = self.documents.read().await;
            documents.get(id).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => self
                .documents
                .write()
                .await
                .entry(id.to_string())
                .or_default()
                .clone(),
        };

        cell.get_or_try_init(|| self.construct(id))
            .await
            .cloned()
    }

    async fn construct(&self, id: &str) -> Result<Arc<Document>, StoreError> {
        let persistence = self.persistence.clone();
        let key = id.to_string();
        let loaded = tokio::task::spawn_blocking(move || persistence.load(&key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let doc = yrs::Doc::new();
        match loaded {
            Some(bytes) => restore(&doc, id, &bytes),
            None => log::debug!("No persisted state for {id}, starting empty"),
        }

        Ok(Arc::new(Document::new(id, doc)))
    }

    /// The live document for `id`, if it has been created.
    pub async fn get(&self, id: &str) -> Option<Arc<Document>> {
        let documents = self.documents.read().await;
        documents.get(id).and_then(|cell| cell.get().cloned())
    }

    /// Full state encoding of a live document.
    pub async fn snapshot(&self, id: &str) -> Option<Vec<u8>> {
        let document = self.get(id).await?;
        Some(document.snapshot().await)
    }

    /// Merge a delta into a live document.
    ///
    /// `Ok(None)` means the id is not live; that is a race with a departed
    /// session, so it is logged and dropped rather than reported.
    pub async fn merge(&self, id: &str, delta: &[u8]) -> Result<Option<DocumentChange>, ProtocolError> {
        let Some(document) = self.get(id).await else {
            log::warn!("Dropping delta for unknown document {id}");
            return Ok(None);
        };
        let version = document.lock().await.apply(delta)?;
        Ok(Some(self.notify(&document, version, delta)))
    }

    /// Emit the change notification for a merge done through a guard.
    pub fn notify(&self, document: &Document, version: u64, delta: &[u8]) -> DocumentChange {
        let change = DocumentChange {
            document_id: document.id.clone(),
            version,
            delta: Arc::new(delta.to_vec()),
        };
        // No subscribers is fine (e.g. storage-less tests).
        let _ = self.changes.send(change.clone());
        change
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Ids of all live documents.
    pub async fn document_ids(&self) -> Vec<String> {
        let documents = self.documents.read().await;
        documents
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of live documents with unpersisted merges.
    pub async fn dirty_documents(&self) -> Vec<String> {
        let documents = self.documents.read().await;
        documents
            .iter()
            .filter_map(|(id, cell)| cell.get().filter(|d| d.is_dirty()).map(|_| id.clone()))
            .collect()
    }

    /// Number of live documents.
    pub async fn len(&self) -> usize {
        self.document_ids().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }
}
