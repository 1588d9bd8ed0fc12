//! Integration tests for presence and cursor synchronization.
//!
//! These tests start a real server and connect several clients, verifying
//! color assignment, cursor and awareness broadcast, and the presence list
//! handed to late joiners.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sowntra_collab::presence::{ANONYMOUS, PALETTE};
use sowntra_collab::{Cursor, MemoryStore, PresenceRecord, ServerConfig, ServerMessage, SyncServer};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its endpoint URL.
async fn start_test_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::with_backend(
        ServerConfig::default(),
        Arc::new(MemoryStore::new()),
    ));
    tokio::spawn(async move { server.serve(listener).await });
    format!("ws://{addr}/collaboration")
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Connect, send `join_body`, and return the client with its active-users list.
async fn join_with(url: &str, join_body: Value) -> (Client, Vec<PresenceRecord>) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(&mut ws, join_body).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Sync { .. }));
    match recv(&mut ws).await {
        ServerMessage::ActiveUsers { users } => (ws, users),
        other => panic!("expected active-users, got {other:?}"),
    }
}

async fn join(url: &str, name: &str) -> (Client, Vec<PresenceRecord>) {
    join_with(
        url,
        json!({"type": "join", "documentId": "board", "userId": format!("id-{name}"), "userName": name}),
    )
    .await
}

/// Read the `user-joined` announcement and return the color it carries.
async fn joined_color(ws: &mut Client, expected_name: &str) -> String {
    match recv(ws).await {
        ServerMessage::UserJoined { user_name, color, .. } => {
            assert_eq!(user_name, expected_name);
            color
        }
        other => panic!("expected user-joined, got {other:?}"),
    }
}

// ─── Presence Protocol Tests ─────────────────────────────────────

#[tokio::test]
async fn test_presence_join_broadcast() {
    let url = start_test_server().await;
    let (mut alice, _) = join(&url, "Alice").await;
    let (_bob, users) = join(&url, "Bob").await;

    let color = joined_color(&mut alice, "Bob").await;
    assert!(PALETTE.contains(&color.as_str()));

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_name, "Alice");
    assert_eq!(users[0].user_id.as_deref(), Some("id-Alice"));
    assert!(PALETTE.contains(&users[0].color.as_str()));
    assert!(users[0].cursor.is_none());
}

#[tokio::test]
async fn test_cursor_broadcast() {
    let url = start_test_server().await;
    let (mut alice, _) = join(&url, "Alice").await;
    let (mut bob, users) = join(&url, "Bob").await;
    let alice_color = users[0].color.clone();
    joined_color(&mut alice, "Bob").await;

    send(&mut alice, json!({"type": "cursor", "cursor": {"x": 120.5, "y": -40}})).await;

    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::Cursor {
            user_id: Some("id-Alice".into()),
            user_name: "Alice".into(),
            color: alice_color,
            cursor: Cursor::new(120.5, -40.0),
        }
    );
}

#[tokio::test]
async fn test_cursor_latest_wins_for_late_joiner() {
    let url = start_test_server().await;
    let (mut alice, _) = join(&url, "Alice").await;
    let (mut bob, _) = join(&url, "Bob").await;
    joined_color(&mut alice, "Bob").await;

    for (x, y) in [(1.0, 1.0), (2.0, 2.0), (300.0, 150.0)] {
        send(&mut alice, json!({"type": "cursor", "cursor": {"x": x, "y": y}})).await;
        assert!(matches!(recv(&mut bob).await, ServerMessage::Cursor { .. }));
    }

    let (_carol, users) = join(&url, "Carol").await;
    assert_eq!(users.len(), 2);
    let alice_record = users.iter().find(|u| u.user_name == "Alice").unwrap();
    assert_eq!(alice_record.cursor, Some(Cursor::new(300.0, 150.0)));
    let bob_record = users.iter().find(|u| u.user_name == "Bob").unwrap();
    assert!(bob_record.cursor.is_none());
}

#[tokio::test]
async fn test_awareness_relayed_verbatim() {
    let url = start_test_server().await;
    let (mut alice, _) = join(&url, "Alice").await;
    let (mut bob, _) = join(&url, "Bob").await;
    joined_color(&mut alice, "Bob").await;

    let state = json!({"selection": ["rect-1", "text-7"], "tool": {"name": "pen", "size": 3}});
    send(&mut bob, json!({"type": "awareness", "state": state})).await;

    match recv(&mut alice).await {
        ServerMessage::Awareness { user_name, state: relayed, .. } => {
            assert_eq!(user_name, "Bob");
            assert_eq!(relayed, state);
        }
        other => panic!("expected awareness, got {other:?}"),
    }
}

#[tokio::test]
async fn test_anonymous_and_legacy_board_id() {
    let url = start_test_server().await;
    let (mut first, _) = join_with(&url, json!({"type": "join", "boardId": "board"})).await;
    let (_second, users) = join(&url, "Named").await;

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_name, ANONYMOUS);
    assert!(users[0].user_id.is_none());
    joined_color(&mut first, "Named").await;
}

#[tokio::test]
async fn test_user_left_carries_identity() {
    let url = start_test_server().await;
    let (mut alice, _) = join(&url, "Alice").await;
    let (bob, _) = join(&url, "Bob").await;
    joined_color(&mut alice, "Bob").await;

    drop(bob);

    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::UserLeft {
            user_id: Some("id-Bob".into()),
            user_name: "Bob".into(),
        }
    );

    // The departed session no longer appears to newcomers.
    let (_carol, users) = join(&url, "Carol").await;
    let names: Vec<&str> = users.iter().map(|u| u.user_name.as_str()).collect();
    assert_eq!(names, vec!["Alice"]);
}

#[tokio::test]
async fn test_cursor_before_join_rejected() {
    let url = start_test_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut ws, json!({"type": "cursor", "cursor": {"x": 0, "y": 0}})).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::Error { message: "Not joined to a document".into() }
    );

    send(&mut ws, json!({"type": "join", "documentId": "board"})).await;
    send(&mut ws, json!({"type": "cursor", "cursor": {"x": "left"}})).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Sync { .. }));
    assert!(matches!(recv(&mut ws).await, ServerMessage::ActiveUsers { .. }));
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.starts_with("Invalid cursor message:")),
        other => panic!("expected error, got {other:?}"),
    }
}
