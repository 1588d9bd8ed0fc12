//! JSON envelope protocol spoken at the collaboration endpoint.
//!
//! Every frame is a JSON object `{ "type": string, ...fields }`. Byte
//! payloads (Yjs updates and state) travel as arrays of integers 0–255.
//!
//! ```text
//! client → server   join · sync · update · awareness · cursor
//! server → client   sync · active-users · user-joined · update
//!                   awareness · cursor · user-left · error
//! ```
//!
//! Decoding is two-step: the envelope must be an object with a string
//! `type` (otherwise [`ProtocolError::InvalidFormat`]), then known types are
//! decoded into their typed body. Unknown types decode to
//! [`ClientMessage::Unknown`] so the relay can log and drop them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::presence::{Cursor, PresenceRecord};

/// Inbound message kinds the relay dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Sync,
    Update,
    Awareness,
    Cursor,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Sync => "sync",
            Self::Update => "update",
            Self::Awareness => "awareness",
            Self::Cursor => "cursor",
        }
    }

    pub fn from_type(tag: &str) -> Option<Self> {
        match tag {
            "join" => Some(Self::Join),
            "sync" => Some(Self::Sync),
            "update" => Some(Self::Update),
            "awareness" => Some(Self::Awareness),
            "cursor" => Some(Self::Cursor),
            _ => None,
        }
    }
}

/// `join` body. `boardId` is accepted for older clients.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default, alias = "boardId")]
    pub document_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Deserialize)]
struct SyncBody {
    state: Vec<u8>,
}

#[derive(Deserialize)]
struct UpdateBody {
    update: Vec<u8>,
}

#[derive(Deserialize)]
struct AwarenessBody {
    #[serde(default)]
    state: Value,
}

#[derive(Deserialize)]
struct CursorBody {
    cursor: Cursor,
}

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinRequest),
    /// Full state for out-of-band resync.
    Sync { state: Vec<u8> },
    /// One merge-ready delta.
    Update { update: Vec<u8> },
    Awareness { state: Value },
    Cursor { cursor: Cursor },
    /// Well-formed envelope with a type this server does not handle.
    Unknown(String),
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed envelope.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let tag = match value.as_object().and_then(|obj| obj.get("type")) {
            Some(Value::String(tag)) => tag.clone(),
            _ => return Err(ProtocolError::InvalidFormat),
        };

        let Some(kind) = MessageKind::from_type(&tag) else {
            return Ok(Self::Unknown(tag));
        };

        Ok(match kind {
            MessageKind::Join => Self::Join(body(kind, value)?),
            MessageKind::Sync => {
                let SyncBody { state } = body(kind, value)?;
                Self::Sync { state }
            }
            MessageKind::Update => {
                let UpdateBody { update } = body(kind, value)?;
                Self::Update { update }
            }
            MessageKind::Awareness => {
                let AwarenessBody { state } = body(kind, value)?;
                Self::Awareness { state }
            }
            MessageKind::Cursor => {
                let CursorBody { cursor } = body(kind, value)?;
                Self::Cursor { cursor }
            }
        })
    }

    /// Kind of this message, `None` for unknown types.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::Join(_) => Some(MessageKind::Join),
            Self::Sync { .. } => Some(MessageKind::Sync),
            Self::Update { .. } => Some(MessageKind::Update),
            Self::Awareness { .. } => Some(MessageKind::Awareness),
            Self::Cursor { .. } => Some(MessageKind::Cursor),
            Self::Unknown(_) => None,
        }
    }
}

fn body<T: DeserializeOwned>(kind: MessageKind, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidField {
        kind: kind.as_str(),
        detail: e.to_string(),
    })
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot, sent once on join.
    Sync { state: Vec<u8> },

    /// Everyone else on the board, sent once on join.
    ActiveUsers { users: Vec<PresenceRecord> },

    #[serde(rename_all = "camelCase")]
    UserJoined {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        user_name: String,
        color: String,
    },

    Update { update: Vec<u8> },

    #[serde(rename_all = "camelCase")]
    Awareness {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        user_name: String,
        color: String,
        #[serde(default)]
        state: Value,
    },

    #[serde(rename_all = "camelCase")]
    Cursor {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        user_name: String,
        color: String,
        cursor: Cursor,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        user_name: String,
    },

    Error { message: String },
}

impl ServerMessage {
    pub fn user_joined(record: &PresenceRecord) -> Self {
        Self::UserJoined {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            color: record.color.clone(),
        }
    }

    pub fn user_left(record: &PresenceRecord) -> Self {
        Self::UserLeft {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
        }
    }

    pub fn awareness(record: &PresenceRecord, state: Value) -> Self {
        Self::Awareness {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            color: record.color.clone(),
            state,
        }
    }

    pub fn cursor(record: &PresenceRecord, cursor: Cursor) -> Self {
        Self::Cursor {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            color: record.color.clone(),
            cursor,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    /// The envelope `type` string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::ActiveUsers { .. } => "active-users",
            Self::UserJoined { .. } => "user-joined",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
            Self::Cursor { .. } => "cursor",
            Self::UserLeft { .. } => "user-left",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame (client side and tests).
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
