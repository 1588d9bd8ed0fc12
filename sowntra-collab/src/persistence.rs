//! Debounced write-back of document state.
//!
//! Change notifications only mark a document as pending. A ticker then writes
//! each pending document's full snapshot at most once per interval, so a burst
//! of merges costs one write. Failed writes stay pending for the next tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::document::{Document, DocumentStore};
use crate::error::StoreError;

/// Write-back counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub snapshots_written: u64,
    pub write_failures: u64,
    /// Documents waiting for the next tick.
    pub pending: usize,
}

/// Background scheduler writing dirty documents to the persistence backend.
pub struct PersistenceSync {
    store: Arc<DocumentStore>,
    interval: Duration,
    pending: Mutex<HashSet<String>>,
    snapshots_written: AtomicU64,
    write_failures: AtomicU64,
}

impl PersistenceSync {
    pub fn new(store: Arc<DocumentStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            pending: Mutex::new(HashSet::new()),
            snapshots_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark a document for the next write-back tick.
    pub async fn schedule(&self, document_id: &str) {
        self.pending.lock().await.insert(document_id.to_string());
    }

    /// Mark every dirty document for the next tick.
    pub async fn schedule_dirty(&self) -> usize {
        let dirty = self.store.dirty_documents().await;
        let count = dirty.len();
        self.pending.lock().await.extend(dirty);
        count
    }

    /// Write one document's current snapshot if it has unpersisted merges.
    ///
    /// Returns `Ok(false)` when there was nothing to write. Writes of one
    /// document are serialized; different documents write independently.
    pub async fn flush_document(&self, document: &Document) -> Result<bool, StoreError> {
        let _serial = document.begin_write().await;
        if !document.is_dirty() {
            return Ok(false);
        }

        let (state, version) = {
            let guard = document.lock().await;
            (guard.snapshot(), guard.version())
        };
        let at = SystemTime::now();
        let backend = self.store.persistence().clone();
        let id = document.id().to_string();
        let size = state.len();

        let result = tokio::task::spawn_blocking(move || backend.save(&id, &state, at))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|saved| saved);

        match result {
            Ok(()) => {
                document.mark_persisted(version, at);
                self.snapshots_written.fetch_add(1, Ordering::Relaxed);
                log::debug!("Persisted {} at version {version} ({size} bytes)", document.id());
                Ok(true)
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist document {}: {e}", document.id());
                Err(e)
            }
        }
    }

    /// Flush a document by id. Unknown ids are a no-op.
    pub async fn flush_id(&self, document_id: &str) -> Result<bool, StoreError> {
        match self.store.get(document_id).await {
            Some(document) => self.flush_document(&document).await,
            None => Ok(false),
        }
    }

    /// Write every pending document once. Failures are re-queued.
    pub async fn flush_pending(&self) -> usize {
        let batch: Vec<String> = self.pending.lock().await.drain().collect();
        let mut written = 0;
        for id in batch {
            match self.flush_id(&id).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(_) => {
                    self.pending.lock().await.insert(id);
                }
            }
        }
        written
    }

    /// Write every dirty document once, regardless of schedule.
    pub async fn flush_all(&self) -> usize {
        let mut written = 0;
        for id in self.store.dirty_documents().await {
            if let Ok(true) = self.flush_id(&id).await {
                written += 1;
            }
        }
        written
    }

    /// Run the scheduler until `shutdown` flips to `true`, then flush once more.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        tokio::spawn(async move {
            // Merges that happened before we subscribed.
            self.schedule_dirty().await;

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !*shutdown.borrow() {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => self.schedule(&change.document_id).await,
                        Err(RecvError::Lagged(skipped)) => {
                            let rescheduled = self.schedule_dirty().await;
                            log::warn!(
                                "Write-back lagged by {skipped} notifications, rescheduled {rescheduled} documents"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        self.flush_pending().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let written = self.flush_all().await;
            log::info!("Write-back stopped, flushed {written} documents");
        })
    }

    pub async fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            pending: self.pending.lock().await.len(),
        }
    }
}
