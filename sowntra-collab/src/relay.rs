//! Update relay: the per-session state machine and message dispatch.
//!
//! ```text
//! Connecting ──join──► Joined ──first accepted message──► Active
//!      │                  │                                  │
//!      └──────────────────┴────────── disconnect ────────────┴──► Disconnected
//! ```
//!
//! Each inbound [`ClientMessage`] is routed to one handler that mutates the
//! document store, registry or presence tracker and returns an [`Outcome`]:
//! replies for the sender and messages for the sender's peers. A join is the
//! exception: its replies and announcement are queued while it holds the
//! document lock. The transport only feeds frames in and drains the session
//! outbox, so the whole protocol can be driven without sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::DocumentStore;
use crate::error::ProtocolError;
use crate::persistence::PersistenceSync;
use crate::presence::{Cursor, PresenceTracker};
use crate::protocol::{ClientMessage, JoinRequest, ServerMessage};
use crate::registry::{Frame, Outbox, SessionRegistry};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Active,
    Disconnected,
}

/// Server-side view of one connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    document_id: Option<String>,
    outbox: Outbox,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Document this session joined, if any.
    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// Queue a message for this session only. Returns false if the
    /// connection is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(text) => self.outbox.send(Frame::from(text)).is_ok(),
            Err(e) => {
                log::error!("Failed to encode {} for {}: {e}", message.type_name(), self.id);
                false
            }
        }
    }
}

/// Messages produced by handling one inbound message.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// Sent to the originating session, in order.
    pub replies: Vec<ServerMessage>,
    /// Sent to every other session on the document.
    pub broadcast: Vec<ServerMessage>,
}

impl Outcome {
    fn broadcast(message: ServerMessage) -> Self {
        Self {
            replies: Vec::new(),
            broadcast: vec![message],
        }
    }
}

/// The dispatch core shared by all connections.
pub struct Relay {
    store: Arc<DocumentStore>,
    registry: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
    persistence: Option<Arc<PersistenceSync>>,
    protocol_errors: AtomicU64,
}

impl Relay {
    pub fn new(
        store: Arc<DocumentStore>,
        registry: Arc<SessionRegistry>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            store,
            registry,
            presence,
            persistence: None,
            protocol_errors: AtomicU64::new(0),
        }
    }

    /// Flush documents through `persistence` when their last session leaves.
    pub fn with_persistence(mut self, persistence: Arc<PersistenceSync>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Create a session in the `Connecting` state plus the receiving end of
    /// its outbox.
    pub fn open_session(&self) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let session = Session {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            document_id: None,
            outbox,
        };
        (session, rx)
    }

    /// Decode and handle one text frame. Protocol errors are reported to the
    /// sender; the session stays open.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) {
        let result = match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(session, message).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => self.deliver(session, outcome).await,
            Err(e) => self.report(session, &e),
        }
    }

    /// Route a decoded message to its handler.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        message: ClientMessage,
    ) -> Result<Outcome, ProtocolError> {
        if session.state == SessionState::Disconnected {
            return Ok(Outcome::default());
        }

        let outcome = match message {
            ClientMessage::Unknown(tag) => {
                log::warn!("Ignoring unknown message type {tag:?} from {}", session.id);
                return Ok(Outcome::default());
            }
            ClientMessage::Join(request) => return self.on_join(session, request).await,
            _ if session.document_id.is_none() => return Err(ProtocolError::NotJoined),
            ClientMessage::Sync { state } => self.on_sync(session, &state).await?,
            ClientMessage::Update { update } => self.on_update(session, update).await?,
            ClientMessage::Awareness { state } => self.on_awareness(session, state).await,
            ClientMessage::Cursor { cursor } => self.on_cursor(session, cursor).await,
        };

        if session.state == SessionState::Joined {
            session.state = SessionState::Active;
        }
        Ok(outcome)
    }

    /// Send replies to the session, then fan out to its peers.
    pub async fn deliver(&self, session: &Session, outcome: Outcome) {
        for reply in &outcome.replies {
            session.send(reply);
        }
        if outcome.broadcast.is_empty() {
            return;
        }
        let Some(document_id) = session.document_id() else {
            return;
        };
        for message in &outcome.broadcast {
            self.registry
                .broadcast(document_id, message, Some(&session.id))
                .await;
        }
    }

    /// Reply with an `error` message.
    pub fn report(&self, session: &Session, error: &ProtocolError) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("Protocol error from {}: {error}", session.id);
        session.send(&ServerMessage::error(error));
    }

    /// Tear a session down. Safe to call more than once; only the first call
    /// notifies peers.
    pub async fn disconnect(&self, session: &mut Session) {
        if session.state == SessionState::Disconnected {
            return;
        }
        session.state = SessionState::Disconnected;

        let Some(document_id) = session.document_id.take() else {
            return;
        };

        // Same lock as a join, so a concurrent joiner either lists this
        // session and then sees it leave, or never sees it at all.
        let document = self.store.get(&document_id).await;
        let guard = match &document {
            Some(document) => Some(document.lock().await),
            None => None,
        };
        let remaining = self.registry.leave(&document_id, &session.id).await;
        let record = self.presence.remove(&session.id).await;
        if let (Some(_), Some(record)) = (remaining, &record) {
            self.registry
                .broadcast(&document_id, &ServerMessage::user_left(record), None)
                .await;
        }
        drop(guard);

        if let (Some(remaining), Some(record)) = (remaining, record) {
            log::info!(
                "{} ({}) left {document_id}, {remaining} remaining",
                record.user_name,
                session.id
            );

            if remaining == 0 {
                if let Some(persistence) = &self.persistence {
                    // Errors are logged by the flush and retried on the next tick.
                    if persistence.flush_id(&document_id).await.is_err() {
                        persistence.schedule(&document_id).await;
                    }
                }
            }
        }
    }

    async fn on_join(&self, session: &mut Session, request: JoinRequest) -> Result<Outcome, ProtocolError> {
        if session.document_id.is_some() {
            return Err(ProtocolError::AlreadyJoined);
        }
        let document_id = request
            .document_id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingDocumentId)?;

        let document = self.store.get_or_create(&document_id).await.map_err(|e| {
            log::error!("Failed to load document {document_id}: {e}");
            ProtocolError::DocumentUnavailable
        })?;

        let record = self
            .presence
            .register(session.id, request.user_id, request.user_name)
            .await;

        // Everything this join makes visible happens under the document lock:
        // registration, the snapshot, the peer list and the announcement.
        // Merges and departures take the same lock, so the joiner's `sync`
        // precedes every later delta and its `active-users` list agrees with
        // every later `user-left`.
        let peers = {
            let guard = document.lock().await;
            self.registry
                .join(&document_id, session.id, session.outbox.clone())
                .await;
            session.send(&ServerMessage::Sync {
                state: guard.snapshot(),
            });

            let peers: Vec<Uuid> = self
                .registry
                .sessions(&document_id)
                .await
                .into_iter()
                .filter(|id| *id != session.id)
                .collect();
            let users = self.presence.records(&peers).await;
            session.send(&ServerMessage::ActiveUsers { users });
            self.registry
                .broadcast(&document_id, &ServerMessage::user_joined(&record), Some(&session.id))
                .await;
            drop(guard);
            peers.len()
        };

        log::info!(
            "{} ({}) joined {document_id} with {peers} peers",
            record.user_name,
            session.id,
        );
        session.document_id = Some(document_id);
        session.state = SessionState::Joined;

        Ok(Outcome::default())
    }

    async fn on_sync(&self, session: &Session, state: &[u8]) -> Result<Outcome, ProtocolError> {
        let document_id = session.document_id().ok_or(ProtocolError::NotJoined)?;
        self.store.merge(document_id, state).await?;
        Ok(Outcome::default())
    }

    async fn on_update(&self, session: &Session, update: Vec<u8>) -> Result<Outcome, ProtocolError> {
        let document_id = session.document_id().ok_or(ProtocolError::NotJoined)?;
        Ok(match self.store.merge(document_id, &update).await? {
            Some(change) => {
                log::debug!("Merged update into {document_id} at version {}", change.version);
                Outcome::broadcast(ServerMessage::Update { update })
            }
            None => Outcome::default(),
        })
    }

    async fn on_awareness(&self, session: &Session, state: Value) -> Outcome {
        match self.presence.update_awareness(&session.id, state.clone()).await {
            Some(record) => Outcome::broadcast(ServerMessage::awareness(&record, state)),
            None => Outcome::default(),
        }
    }

    async fn on_cursor(&self, session: &Session, cursor: Cursor) -> Outcome {
        match self.presence.update_cursor(&session.id, cursor).await {
            Some(record) => Outcome::broadcast(ServerMessage::cursor(&record, cursor)),
            None => Outcome::default(),
        }
    }

    /// Number of protocol errors reported to clients.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }
}
