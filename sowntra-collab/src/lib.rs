//! # sowntra-collab — Real-time collaboration engine for shared design boards
//!
//! Sessions join a board over WebSocket, receive the authoritative Yrs state,
//! and exchange merge-ready deltas and presence with everyone else on it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WS   ┌─────────────┐
//! │ Client      │ ◄──────────────► │ SyncServer  │
//! │ (Yjs doc)   │                  │             │
//! └─────────────┘                  └──────┬──────┘
//!                                         │ frames
//!                                  ┌──────┴──────┐
//!                                  │ Relay       │ join/sync/update/
//!                                  │             │ awareness/cursor
//!                                  └──┬───┬───┬──┘
//!                   ┌─────────────────┘   │   └──────────────┐
//!                   ▼                     ▼                  ▼
//!           ┌──────────────┐     ┌────────────────┐  ┌────────────────┐
//!           │DocumentStore │     │SessionRegistry │  │PresenceTracker │
//!           │(Yrs authority)│    │(fan-out)       │  │(name/color/cur)│
//!           └──────┬───────┘     └────────────────┘  └────────────────┘
//!                  │ changes
//!           ┌──────┴────────┐
//!           │PersistenceSync│ ──► RocksDB (LZ4 state + metadata)
//!           └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — per-document Yrs state, merge, snapshot, change feed
//! - [`registry`] — sessions per document and broadcast
//! - [`presence`] — colors, names, cursors, awareness
//! - [`protocol`] — JSON envelope codec
//! - [`relay`] — session state machine and dispatch
//! - [`persistence`] — debounced write-back
//! - [`storage`] — persistence backends
//! - [`server`] — WebSocket transport
//! - [`update_check`] — structural check of untrusted update bytes

pub mod config;
pub mod document;
pub mod error;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;
pub mod update_check;

// Re-exports for convenience
pub use config::ServerConfig;
pub use document::{Document, DocumentChange, DocumentGuard, DocumentStore};
pub use error::{ConfigError, MalformedUpdate, ProtocolError, ServerError, StoreError};
pub use persistence::{PersistenceStats, PersistenceSync};
pub use presence::{Cursor, PresenceRecord, PresenceTracker};
pub use protocol::{ClientMessage, JoinRequest, MessageKind, ServerMessage};
pub use registry::{Frame, Outbox, RegistryStats, SessionRegistry};
pub use relay::{Outcome, Relay, Session, SessionState};
pub use server::{ServerStats, SyncServer};
pub use storage::{DocumentMetadata, MemoryStore, Persistence, RocksStore, StoreConfig};
