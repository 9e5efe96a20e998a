//! Awareness flows over real WebSocket connections: cursors, selections,
//! presence snapshots, and departure notifications.

use std::sync::Arc;

use coedit::{CollabServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server() -> (u16, Arc<CollabServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(CollabServer::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> Option<Value> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).ok(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Join and return the `presence_info` frame that follows the state.
async fn join(ws: &mut Ws, user: &str, doc: &str) -> Value {
    send(
        ws,
        json!({ "type": "join_document", "userId": user, "documentId": doc, "userName": user }),
    )
    .await;
    let state = recv(ws).await.expect("document_state");
    assert_eq!(state["type"], "document_state");
    let presence = recv(ws).await.expect("presence_info");
    assert_eq!(presence["type"], "presence_info");
    presence
}

/// Drain frames until one of `wanted` type arrives.
async fn recv_of_type(ws: &mut Ws, wanted: &str) -> Option<Value> {
    for _ in 0..10 {
        match recv(ws).await {
            Some(frame) if frame["type"] == wanted => return Some(frame),
            Some(_) => continue,
            None => return None,
        }
    }
    None
}

fn insert_op(pos: u32, content: &str, user: &str, op_id: &str) -> Value {
    json!({
        "type": "operation",
        "operation": {
            "type": "insert",
            "position": pos,
            "userId": user,
            "content": content,
            "operationId": op_id,
            "timestamp": "2026-08-02T10:00:00Z",
        },
    })
}

#[tokio::test]
async fn test_presence_snapshot_on_join() {
    let (port, _server) = start_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-presence").await;

    let mut bob = connect(port).await;
    let presence = join(&mut bob, "bob", "doc-presence").await;

    let users = presence["data"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);
    let names: Vec<&str> = users.iter().map(|u| u["peer"].as_str().unwrap()).collect();
    assert!(names.contains(&"alice"));
    assert!(names.contains(&"bob"));
    for user in users {
        assert_eq!(user["online"], true);
        assert!(user["color"].as_str().unwrap().starts_with('#'));
    }
}

#[tokio::test]
async fn test_cursor_update_broadcast_and_clamped() {
    let (port, _server) = start_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-cursor").await;
    send(&mut alice, insert_op(0, "hello", "alice", "op-1")).await;

    let mut bob = connect(port).await;
    join(&mut bob, "bob", "doc-cursor").await;

    // Position far past the five visible characters: clamped to 5.
    send(&mut alice, json!({ "type": "cursor_update", "cursor": { "position": 999 } })).await;

    let changed = recv_of_type(&mut bob, "cursor_changed").await.unwrap();
    assert_eq!(changed["userId"], "alice");
    assert_eq!(changed["data"]["cursor"]["pos"], 5);
}

#[tokio::test]
async fn test_selection_update_normalized() {
    let (port, _server) = start_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-select").await;
    send(&mut alice, insert_op(0, "hello world", "alice", "op-1")).await;

    let mut bob = connect(port).await;
    join(&mut bob, "bob", "doc-select").await;

    // Reversed endpoints: the registry normalizes start <= end.
    send(
        &mut alice,
        json!({ "type": "selection_update", "selection": { "start": 9, "end": 2 } }),
    )
    .await;

    let changed = recv_of_type(&mut bob, "selection_changed").await.unwrap();
    assert_eq!(changed["userId"], "alice");
    assert_eq!(changed["data"]["selection"]["start"], 2);
    assert_eq!(changed["data"]["selection"]["end"], 9);
}

#[tokio::test]
async fn test_cursor_updates_not_echoed_to_sender() {
    let (port, _server) = start_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-noecho").await;
    let mut bob = connect(port).await;
    join(&mut bob, "bob", "doc-noecho").await;
    let _ = recv_of_type(&mut alice, "user_joined").await;

    send(&mut alice, json!({ "type": "cursor_update", "cursor": { "position": 0 } })).await;

    let bob_sees = recv_of_type(&mut bob, "cursor_changed").await;
    assert!(bob_sees.is_some());
    let echo = timeout(Duration::from_millis(300), alice.next()).await;
    assert!(echo.is_err(), "sender must not receive its own cursor event");
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left() {
    let (port, _server) = start_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-leave").await;
    let mut bob = connect(port).await;
    join(&mut bob, "bob", "doc-leave").await;
    let _ = recv_of_type(&mut alice, "user_joined").await;

    bob.close(None).await.unwrap();

    let left = recv_of_type(&mut alice, "user_left").await.unwrap();
    assert_eq!(left["data"]["userId"], "bob");
    assert_eq!(left["userId"], "bob");
}

#[tokio::test]
async fn test_second_connection_keeps_peer_present() {
    let (port, _server) = start_server().await;

    // Bob holds two connections; closing one must not announce a leave.
    let mut alice = connect(port).await;
    join(&mut alice, "alice", "doc-two-conns").await;
    let mut bob1 = connect(port).await;
    join(&mut bob1, "bob", "doc-two-conns").await;
    let mut bob2 = connect(port).await;
    join(&mut bob2, "bob", "doc-two-conns").await;
    let _ = recv_of_type(&mut alice, "user_joined").await;

    bob1.close(None).await.unwrap();
    let frame = timeout(Duration::from_millis(400), async {
        recv_of_type(&mut alice, "user_left").await
    })
    .await;
    assert!(
        matches!(frame, Err(_)),
        "no user_left while bob still holds a connection"
    );

    bob2.close(None).await.unwrap();
    let left = recv_of_type(&mut alice, "user_left").await.unwrap();
    assert_eq!(left["data"]["userId"], "bob");
}
