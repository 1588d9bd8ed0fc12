//! WebSocket sync server at the collaboration endpoint.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── DocumentStore (Yrs Doc per document)
//!            ├── Relay ────────┼── SessionRegistry ── outbox per session
//! Client B ──┘                 └── PresenceTracker
//!                                        │
//!                       PersistenceSync ◄┘ change notifications
//!                              │
//!                        Persistence (RocksDB / memory)
//! ```
//!
//! Each connection runs one loop that reads frames into the relay and drains
//! the session's outbox back onto the socket. Every way a connection can end
//! (close frame, stream end, transport error) goes through the same teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::document::DocumentStore;
use crate::error::{ProtocolError, ServerError};
use crate::persistence::PersistenceSync;
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::relay::Relay;
use crate::storage::{MemoryStore, Persistence, RocksStore, StoreConfig};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub protocol_errors: u64,
    pub active_documents: usize,
    pub active_sessions: usize,
    pub snapshots_written: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    persistence: Arc<PersistenceSync>,
    counters: Arc<ConnectionCounters>,
    shutdown: watch::Sender<bool>,
    write_back: Mutex<Option<JoinHandle<()>>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` when configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let backend: Arc<dyn Persistence> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Create a server over an explicit persistence backend.
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn Persistence>) -> Self {
        let store = Arc::new(DocumentStore::new(backend));
        let persistence = Arc::new(PersistenceSync::new(store.clone(), config.save_interval));
        let relay = Relay::new(
            store,
            Arc::new(SessionRegistry::new()),
            Arc::new(PresenceTracker::new()),
        )
        .with_persistence(persistence.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            relay: Arc::new(relay),
            persistence,
            counters: Arc::new(ConnectionCounters::default()),
            shutdown,
            write_back: Mutex::new(None),
        }
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        self.start_write_back().await;
        log::info!(
            "Sync server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.path
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let relay = self.relay.clone();
                    let counters = self.counters.clone();
                    let path = self.config.path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, relay, counters, path).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Sync server stopped accepting connections");
        Ok(())
    }

    async fn start_write_back(&self) {
        let mut write_back = self.write_back.lock().await;
        if write_back.is_none() {
            let handle = self.persistence.clone().spawn(self.shutdown.subscribe());
            *write_back = Some(handle);
        }
    }

    /// Stop accepting connections and flush every dirty document.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.write_back.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    log::error!("Write-back task failed: {e}");
                    self.persistence.flush_all().await;
                }
            }
            None => {
                self.persistence.flush_all().await;
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
        counters: Arc<ConnectionCounters>,
        path: String,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut reject = ErrorResponse::new(Some("Not Found".to_string()));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (mut session, mut outbox) = relay.open_session();
        log::info!("WebSocket connection {} established from {addr}", session.id());

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            relay.handle_frame(&mut session, text.as_str()).await;
                        }

                        Some(Ok(Message::Binary(data))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            match std::str::from_utf8(&data) {
                                Ok(text) => relay.handle_frame(&mut session, text).await,
                                Err(_) => relay.report(&session, &ProtocolError::InvalidFormat),
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::warn!("Failed to answer ping from {addr}: {e}");
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing frames queued for this session
                Some(frame) = outbox.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                        log::warn!("Failed to write to {addr}: {e}");
                        break;
                    }
                }
            }
        }

        relay.disconnect(&mut session).await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        // The peer may already be gone.
        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let registry = self.relay.registry().stats().await;
        let persistence = self.persistence.stats().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            protocol_errors: self.relay.protocol_errors(),
            active_documents: self.relay.store().len().await,
            active_sessions: registry.active_sessions,
            snapshots_written: persistence.snapshots_written,
            write_failures: persistence.write_failures,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        self.relay.store()
    }

    pub fn persistence(&self) -> &Arc<PersistenceSync> {
        &self.persistence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_in_memory_by_default() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.config().path, "/collaboration");
        assert!(server.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_backend(ServerConfig::default(), Arc::new(MemoryStore::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.protocol_errors, 0);
        assert_eq!(stats.active_documents, 0);
        assert_eq!(stats.snapshots_written, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = Arc::new(SyncServer::with_backend(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_without_serve_flushes() {
        let backend = Arc::new(MemoryStore::new());
        let server = SyncServer::with_backend(ServerConfig::default(), backend.clone());
        let store = server.store().clone();
        store.get_or_create("B1").await.unwrap();

        let doc = yrs::Doc::new();
        let update = {
            use yrs::{ReadTxn, StateVector, Text, Transact, WriteTxn};
            {
                let mut txn = doc.transact_mut();
                let text = txn.get_or_insert_text("content");
                text.insert(&mut txn, 0, "bye");
            }
            doc.transact().encode_state_as_update_v1(&StateVector::default())
        };
        store.merge("B1", &update).await.unwrap();

        server.shutdown().await;
        assert!(backend.load("B1").unwrap().is_some());
        assert!(store.dirty_documents().await.is_empty());
    }
}
