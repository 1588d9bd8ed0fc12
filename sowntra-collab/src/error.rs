//! Error types shared across the collaboration engine.
//!
//! Nothing here is fatal to the process: protocol errors are reported back to
//! the offending session, storage errors are logged by the write-back
//! scheduler, and server errors only surface from bind/accept.

/// Errors reported to a single session as an `error { message }` reply.
///
/// The `Display` text is exactly what the client receives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Body is not JSON, not an object, or has no string `type`.
    #[error("Invalid message format")]
    InvalidFormat,

    /// A known message type with a missing or mistyped field.
    #[error("Invalid {kind} message: {detail}")]
    InvalidField { kind: &'static str, detail: String },

    #[error("Document ID required")]
    MissingDocumentId,

    #[error("Not joined to a document")]
    NotJoined,

    #[error("Already joined to a document")]
    AlreadyJoined,

    /// Delta or state bytes that the CRDT engine cannot decode.
    #[error("Invalid update payload")]
    InvalidUpdate,

    /// Persisted state could not be read; the join may be retried.
    #[error("Document could not be loaded")]
    DocumentUnavailable,
}

/// Structural defects found while walking a v1 update payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedUpdate {
    #[error("unexpected end of payload at byte {0}")]
    Truncated(usize),

    #[error("invalid variable-length integer at byte {0}")]
    VarInt(usize),

    #[error("string at byte {0} is not valid UTF-8")]
    Utf8(usize),

    #[error("count {count} at byte {offset} exceeds the remaining payload")]
    Count { count: u64, offset: usize },

    #[error("unknown content kind {kind} at byte {offset}")]
    Content { kind: u8, offset: usize },

    #[error("unknown type reference {kind} at byte {offset}")]
    TypeRef { kind: u8, offset: usize },

    #[error("unknown value tag {tag} at byte {offset}")]
    Value { tag: u8, offset: usize },

    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),
}

impl From<MalformedUpdate> for ProtocolError {
    fn from(_: MalformedUpdate) -> Self {
        ProtocolError::InvalidUpdate
    }
}

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Column family '{0}' not found")]
    MissingColumnFamily(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// The blocking task running a storage call panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Invalid configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Errors that stop the server from starting or accepting connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_messages() {
        assert_eq!(ProtocolError::InvalidFormat.to_string(), "Invalid message format");
        assert_eq!(ProtocolError::MissingDocumentId.to_string(), "Document ID required");
        let err = ProtocolError::InvalidField {
            kind: "cursor",
            detail: "missing field `cursor`".into(),
        };
        assert_eq!(err.to_string(), "Invalid cursor message: missing field `cursor`");
    }

    #[test]
    fn test_server_error_wraps_config() {
        let err: ServerError = ConfigError::InvalidValue {
            var: "PORT",
            value: "abc".into(),
        }
        .into();
        assert!(err.to_string().contains("PORT"));
    }
}
