//! Session registry: document id → connected sessions, with fan-out.
//!
//! Every session owns an unbounded FIFO outbox drained by its connection's
//! writer task. A broadcast encodes the message once and pushes the same
//! `Arc<str>` frame into each recipient outbox, so per-session delivery order
//! is the order the server enqueued.
//!
//! A recipient whose connection is gone (closed outbox) is skipped and counted
//! in `messages_dropped`; it is never an error for the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// One pre-encoded outbound text frame.
pub type Frame = Arc<str>;

/// Sending half of a session's outbox.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
    pub active_documents: usize,
}

/// Hot-path counters, updated without taking the registry lock.
#[derive(Default)]
struct AtomicRegistryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Per-document session sets.
#[derive(Default)]
pub struct SessionRegistry {
    documents: RwLock<HashMap<String, HashMap<Uuid, Outbox>>>,
    stats: AtomicRegistryStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a document. Re-joining replaces the outbox.
    pub async fn join(&self, document_id: &str, session_id: Uuid, outbox: Outbox) {
        let mut documents = self.documents.write().await;
        documents
            .entry(document_id.to_string())
            .or_default()
            .insert(session_id, outbox);
    }

    /// Remove a session. Returns the number of sessions left on the document,
    /// or `None` if the session was not registered there.
    pub async fn leave(&self, document_id: &str, session_id: &Uuid) -> Option<usize> {
        let mut documents = self.documents.write().await;
        let sessions = documents.get_mut(document_id)?;
        sessions.remove(session_id)?;
        let remaining = sessions.len();
        if remaining == 0 {
            documents.remove(document_id);
        }
        Some(remaining)
    }

    /// Deliver a message to every session on a document except `exclude`.
    ///
    /// Returns the number of outboxes that accepted the frame. Unknown
    /// documents and encode failures are logged and deliver nothing.
    pub async fn broadcast(
        &self,
        document_id: &str,
        message: &ServerMessage,
        exclude: Option<&Uuid>,
    ) -> usize {
        let frame: Frame = match message.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Failed to encode {} broadcast: {e}", message.type_name());
                return 0;
            }
        };
        self.broadcast_frame(document_id, frame, exclude).await
    }

    /// Fan out an already-encoded frame.
    pub async fn broadcast_frame(&self, document_id: &str, frame: Frame, exclude: Option<&Uuid>) -> usize {
        let documents = self.documents.read().await;
        let Some(sessions) = documents.get(document_id) else {
            log::warn!("Broadcast to unknown document {document_id} dropped");
            return 0;
        };

        let mut delivered = 0;
        for (session_id, outbox) in sessions {
            if exclude == Some(session_id) {
                continue;
            }
            if outbox.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Session {session_id} outbox closed, frame dropped");
            }
        }
        self.stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Ids of sessions on a document.
    pub async fn sessions(&self, document_id: &str) -> Vec<Uuid> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn session_count(&self, document_id: &str) -> usize {
        self.documents
            .read()
            .await
            .get(document_id)
            .map_or(0, HashMap::len)
    }

    pub async fn contains(&self, document_id: &str, session_id: &Uuid) -> bool {
        self.documents
            .read()
            .await
            .get(document_id)
            .is_some_and(|sessions| sessions.contains_key(session_id))
    }

    /// Number of documents with at least one session.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let documents = self.documents.read().await;
        RegistryStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: documents.values().map(HashMap::len).sum(),
            active_documents: documents.len(),
        }
    }
}
