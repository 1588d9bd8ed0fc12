//! Presence tracking: who is on a board, in which color, and where.
//!
//! Presence is advisory. Colors come from a fixed palette and may collide
//! between sessions; nothing here is persisted, and a reconnecting client
//! rebuilds its view from `active-users` plus later broadcasts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cursor palette handed out to joining sessions.
pub const PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8",
    "#F7DC6F", "#BB8FCE", "#85C1E2", "#F8B739", "#52B788",
];

/// Display name used when a join carries none.
pub const ANONYMOUS: &str = "Anonymous";

/// Cursor position in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pick a palette color from the random bits of a v4 session id.
pub fn color_for(session_id: Uuid) -> &'static str {
    let index = (session_id.as_u128() % PALETTE.len() as u128) as usize;
    PALETTE[index]
}

/// Public view of one session's presence, as sent in `active-users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub user_name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    /// Last awareness payload, relayed verbatim.
    awareness: Option<Value>,
}

/// Per-session ephemeral presence.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign presence to a newly joined session.
    ///
    /// Missing or empty names become [`ANONYMOUS`].
    pub async fn register(
        &self,
        session_id: Uuid,
        user_id: Option<String>,
        user_name: Option<String>,
    ) -> PresenceRecord {
        let user_name = user_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        let record = PresenceRecord {
            user_id,
            user_name,
            color: color_for(session_id).to_string(),
            cursor: None,
        };
        self.entries.write().await.insert(
            session_id,
            PresenceEntry {
                record: record.clone(),
                awareness: None,
            },
        );
        record
    }

    /// Overwrite a session's cursor. Returns the updated record.
    pub async fn update_cursor(&self, session_id: &Uuid, cursor: Cursor) -> Option<PresenceRecord> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(session_id)?;
        entry.record.cursor = Some(cursor);
        Some(entry.record.clone())
    }

    /// Overwrite a session's awareness payload. Returns the session's record.
    pub async fn update_awareness(&self, session_id: &Uuid, state: Value) -> Option<PresenceRecord> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(session_id)?;
        entry.awareness = Some(state);
        Some(entry.record.clone())
    }

    /// Drop a session's presence.
    pub async fn remove(&self, session_id: &Uuid) -> Option<PresenceRecord> {
        self.entries
            .write()
            .await
            .remove(session_id)
            .map(|entry| entry.record)
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<PresenceRecord> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.record.clone())
    }

    /// Last awareness payload seen from a session.
    pub async fn awareness(&self, session_id: &Uuid) -> Option<Value> {
        self.entries
            .read()
            .await
            .get(session_id)
            .and_then(|entry| entry.awareness.clone())
    }

    /// Records for the given sessions, skipping unknown ids.
    pub async fn records(&self, session_ids: &[Uuid]) -> Vec<PresenceRecord> {
        let entries = self.entries.read().await;
        session_ids
            .iter()
            .filter_map(|id| entries.get(id).map(|entry| entry.record.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_color_from_palette() {
        for _ in 0..50 {
            assert!(PALETTE.contains(&color_for(Uuid::new_v4())));
        }
    }

    #[test]
    fn test_color_stable_per_session() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(color_for(id), color_for(id));
    }

    #[tokio::test]
    async fn test_register_defaults_name() {
        let tracker = PresenceTracker::new();
        let id = Uuid::new_v4();

        let record = tracker.register(id, None, None).await;
        assert_eq!(record.user_name, ANONYMOUS);
        assert!(record.cursor.is_none());

        let blank = tracker.register(Uuid::new_v4(), Some("u2".into()), Some("  ".into())).await;
        assert_eq!(blank.user_name, ANONYMOUS);
        assert_eq!(blank.user_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_cursor_overwrite() {
        let tracker = PresenceTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, Some("u1".into()), Some("Alice".into())).await;

        tracker.update_cursor(&id, Cursor::new(1.0, 2.0)).await;
        let record = tracker.update_cursor(&id, Cursor::new(10.5, -3.0)).await.unwrap();

        assert_eq!(record.cursor, Some(Cursor::new(10.5, -3.0)));
        assert_eq!(tracker.get(&id).await.unwrap().cursor, Some(Cursor::new(10.5, -3.0)));
    }

    #[tokio::test]
    async fn test_unknown_session_updates_ignored() {
        let tracker = PresenceTracker::new();
        let id = Uuid::new_v4();
        assert!(tracker.update_cursor(&id, Cursor::new(0.0, 0.0)).await.is_none());
        assert!(tracker.update_awareness(&id, json!({})).await.is_none());
        assert!(tracker.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_awareness_kept_per_session() {
        let tracker = PresenceTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, None, Some("Bob".into())).await;

        tracker.update_awareness(&id, json!({"selection": ["el-1"]})).await;
        assert_eq!(tracker.awareness(&id).await, Some(json!({"selection": ["el-1"]})));

        tracker.remove(&id).await;
        assert!(tracker.awareness(&id).await.is_none());
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn test_records_filter_unknown() {
        let tracker = PresenceTracker::new();
        let a = Uuid::new_v4();
        tracker.register(a, None, Some("Alice".into())).await;

        let records = tracker.records(&[a, Uuid::new_v4()]).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_name, "Alice");
    }

    #[test]
    fn test_record_json_shape() {
        let record = PresenceRecord {
            user_id: Some("u1".into()),
            user_name: "Alice".into(),
            color: "#FF6B6B".into(),
            cursor: Some(Cursor::new(1.0, 2.5)),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"userId": "u1", "userName": "Alice", "color": "#FF6B6B", "cursor": {"x": 1.0, "y": 2.5}})
        );

        let bare = PresenceRecord { user_id: None, cursor: None, ..record };
        let value = serde_json::to_value(&bare).unwrap();
        assert!(value.get("userId").is_none());
        assert!(value.get("cursor").is_none());
    }
}
