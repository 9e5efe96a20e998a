//! Sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle over a pluggable [`Transport`]
//! - A local replica kept in step with `operation_received` fan-out
//! - Cursor/selection updates
//! - Offline queue for edits made while disconnected
//!
//! The client surfaces everything as structured [`ClientEvent`]s on an
//! mpsc channel instead of registered callbacks.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::awareness::{AwarenessEntry, CursorState, SelectionState};
use crate::crdt::{seeded, CrdtError, ReplicatedText, SiteId};
use crate::protocol::{UserInfo, WireOperation};
use crate::session::DocMetrics;

/// Client-side errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("replica error: {0}")]
    Replica(#[from] CrdtError),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established and `join_document` sent.
    Connected,
    /// Connection lost.
    Disconnected,
    /// The local replica changed (remote op applied or state adopted).
    ContentChanged { content: String },
    /// A peer joined the document.
    UserJoined(UserInfo),
    /// A peer left the document.
    UserLeft { user_id: String },
    /// A peer moved their cursor.
    CursorUpdated {
        user_id: String,
        cursor: CursorState,
    },
    /// A peer changed their selection.
    SelectionUpdated {
        user_id: String,
        selection: SelectionState,
    },
    /// Full presence refresh from the server.
    PresenceSynced(Vec<AwarenessEntry>),
    /// Reply to `get_metrics`.
    Metrics(DocMetrics),
    /// Structured error reply from the server.
    Error { message: String },
}

/// Two-method transport seam: the client works against any bidirectional
/// frame pipe, not a specific socket library.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame to the server.
    async fn send(&mut self, frame: String) -> Result<(), ClientError>;
    /// Take the inbound frame stream; yields until the transport closes.
    fn incoming(&mut self) -> mpsc::Receiver<String>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    incoming: Option<mpsc::Receiver<String>>,
}

impl WsTransport {
    /// Connect to `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (sink, mut stream) = ws_stream.split();

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self {
            sink,
            incoming: Some(rx),
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), ClientError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    fn incoming(&mut self) -> mpsc::Receiver<String> {
        self.incoming.take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel(1);
            rx
        })
    }
}

/// Edits made while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame for later replay; `false` when the queue is full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Drain all queued frames in submission order.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(String::len).sum()
    }
}

/// The sync client.
pub struct CollabClient {
    user_id: String,
    user_name: String,
    doc_id: String,
    state: Arc<RwLock<ConnectionState>>,
    text: Arc<Mutex<ReplicatedText>>,
    offline: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            doc_id: doc_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            text: Arc::new(Mutex::new(ReplicatedText::new(SiteId(0)))),
            offline: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect over `transport`: sends `join_document`, replays the
    /// offline queue, and spawns the reader/writer tasks.
    pub async fn connect<T: Transport>(&mut self, mut transport: T) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut incoming = transport.incoming();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

        // Writer task: forward the outgoing channel to the transport.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if transport.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let join = json!({
            "type": "join_document",
            "userId": self.user_id,
            "documentId": self.doc_id,
            "userName": self.user_name,
        })
        .to_string();
        out_tx.send(join).await.map_err(|_| ClientError::Closed)?;

        self.outgoing_tx = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Replay edits queued while offline, in submission order.
        {
            let mut offline = self.offline.lock().await;
            let queued = offline.drain();
            if !queued.is_empty() {
                log::info!("replaying {} queued frames", queued.len());
                for frame in queued {
                    let _ = out_tx.send(frame).await;
                }
            }
        }

        // Reader task: apply server events to the local replica.
        let text = self.text.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                handle_frame(&frame, &text, &event_tx).await;
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Insert `content` at `pos` in the local replica and submit it.
    pub async fn insert(&self, pos: u32, content: &str) -> Result<(), ClientError> {
        let wire = {
            let mut text = self.text.lock().await;
            let op = text.insert(pos, content)?;
            self.wire_for(&op)
        };
        self.submit(&wire).await
    }

    /// Delete `length` characters at `pos` locally and submit it.
    pub async fn delete(&self, pos: u32, length: u32) -> Result<(), ClientError> {
        let wire = {
            let mut text = self.text.lock().await;
            let op = text.delete(pos, length)?;
            self.wire_for(&op)
        };
        self.submit(&wire).await
    }

    /// Wire form of a local operation. Edits made before the server
    /// assigned us a site (offline, pre-join) are sent position-only, so
    /// the coordinator stamps them with the connection's site.
    fn wire_for(&self, op: &crate::crdt::Operation) -> WireOperation {
        let mut wire = WireOperation::from_operation(op, &self.user_id, Utc::now());
        if op.site == SiteId(0) {
            wire.site = None;
            wire.lamport = None;
        }
        wire
    }

    async fn submit(&self, wire: &WireOperation) -> Result<(), ClientError> {
        let frame = json!({ "type": "operation", "operation": wire }).to_string();
        if *self.state.read().await != ConnectionState::Connected {
            let mut offline = self.offline.lock().await;
            if !offline.enqueue(frame) {
                return Err(ClientError::Closed);
            }
            return Ok(());
        }
        self.send_frame(frame).await
    }

    /// Report a cursor move. Silently dropped while offline: presence is
    /// soft state and replaying stale cursors is worse than losing them.
    pub async fn update_cursor(&self, position: u32) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send_frame(
            json!({ "type": "cursor_update", "cursor": { "position": position } }).to_string(),
        )
        .await
    }

    /// Report a selection change. Dropped while offline, like cursors.
    pub async fn update_selection(&self, start: u32, end: u32) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send_frame(
            json!({ "type": "selection_update", "selection": { "start": start, "end": end } })
                .to_string(),
        )
        .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send_frame(json!({ "type": "ping" }).to_string()).await
    }

    pub async fn request_metrics(&self) -> Result<(), ClientError> {
        self.send_frame(json!({ "type": "get_metrics" }).to_string())
            .await
    }

    pub async fn request_document_state(&self) -> Result<(), ClientError> {
        self.send_frame(json!({ "type": "get_document_state" }).to_string())
            .await
    }

    async fn send_frame(&self, frame: String) -> Result<(), ClientError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ClientError::Closed),
            None => Err(ClientError::Closed),
        }
    }

    /// Local replica content.
    pub async fn content(&self) -> String {
        self.text.lock().await.content()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline.lock().await.len()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

/// Apply one server frame to the local replica and surface an event.
async fn handle_frame(
    frame: &str,
    text: &Arc<Mutex<ReplicatedText>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    let Ok(value) = serde_json::from_str::<Value>(frame) else {
        log::warn!("undecodable frame from server: {frame}");
        return;
    };
    let event_type = value["type"].as_str().unwrap_or_default().to_string();
    let data = &value["data"];

    let event = match event_type.as_str() {
        "document_state" => {
            // Adopt the server's materialized state wholesale.
            let content = data["content"].as_str().unwrap_or_default();
            let site = SiteId(data["siteId"].as_u64().unwrap_or(0));
            let version = data["version"].as_u64().unwrap_or(0);
            let mut replica = seeded(site, content);
            replica.fast_forward(version);
            *text.lock().await = replica;
            Some(ClientEvent::ContentChanged {
                content: content.to_string(),
            })
        }
        "operation_received" => {
            match serde_json::from_value::<WireOperation>(data["operation"].clone()) {
                Ok(wire) => {
                    let op = wire.to_operation(SiteId(wire.site.unwrap_or(0)), wire.lamport.unwrap_or(0));
                    let mut guard = text.lock().await;
                    match guard.apply_remote(&op) {
                        Ok(true) => Some(ClientEvent::ContentChanged {
                            content: guard.content(),
                        }),
                        Ok(false) => None,
                        Err(e) => {
                            log::warn!("failed to apply remote op: {e}");
                            Some(ClientEvent::Error {
                                message: e.to_string(),
                            })
                        }
                    }
                }
                Err(e) => {
                    log::warn!("bad operation payload: {e}");
                    None
                }
            }
        }
        "user_joined" => serde_json::from_value::<UserInfo>(data["user"].clone())
            .ok()
            .map(ClientEvent::UserJoined),
        "user_left" => data["userId"].as_str().map(|id| ClientEvent::UserLeft {
            user_id: id.to_string(),
        }),
        "cursor_changed" => {
            let user_id = data["userId"].as_str().unwrap_or_default().to_string();
            serde_json::from_value::<CursorState>(data["cursor"].clone())
                .ok()
                .map(|cursor| ClientEvent::CursorUpdated { user_id, cursor })
        }
        "selection_changed" => {
            let user_id = data["userId"].as_str().unwrap_or_default().to_string();
            serde_json::from_value::<SelectionState>(data["selection"].clone())
                .ok()
                .map(|selection| ClientEvent::SelectionUpdated { user_id, selection })
        }
        "presence_info" => serde_json::from_value::<Vec<AwarenessEntry>>(data["users"].clone())
            .ok()
            .map(ClientEvent::PresenceSynced),
        "metrics" => serde_json::from_value::<DocMetrics>(data.clone())
            .ok()
            .map(ClientEvent::Metrics),
        "pong" => None,
        "error" => Some(ClientEvent::Error {
            message: data["error"].as_str().unwrap_or("unknown error").to_string(),
        }),
        other => {
            log::debug!("unhandled event type from server: {other}");
            None
        }
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    /// In-memory transport double: captures sends, feeds canned frames.
    struct ChannelTransport {
        sent: mpsc::Sender<String>,
        incoming: Option<mpsc::Receiver<String>>,
    }

    impl ChannelTransport {
        fn pair() -> (Self, mpsc::Receiver<String>, mpsc::Sender<String>) {
            let (sent_tx, sent_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            (
                Self {
                    sent: sent_tx,
                    incoming: Some(in_rx),
                },
                sent_rx,
                in_tx,
            )
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, frame: String) -> Result<(), ClientError> {
            self.sent.send(frame).await.map_err(|_| ClientError::Closed)
        }

        fn incoming(&mut self) -> mpsc::Receiver<String> {
            self.incoming.take().unwrap_or_else(|| {
                let (_tx, rx) = mpsc::channel(1);
                rx
            })
        }
    }

    #[test]
    fn test_offline_queue_bounds() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue("a".into()));
        assert!(queue.enqueue("bb".into()));
        assert!(!queue.enqueue("c".into()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 3);

        let drained = queue.drain();
        assert_eq!(drained, vec!["a".to_string(), "bb".to_string()]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CollabClient::new("u1", "Alice", "doc-1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert_eq!(client.content().await, "");
    }

    #[tokio::test]
    async fn test_offline_edits_queue_for_replay() {
        let client = CollabClient::new("u1", "Alice", "doc-1");
        client.insert(0, "hello").await.unwrap();
        client.insert(5, "!").await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
        // Edits apply locally even while disconnected.
        assert_eq!(client.content().await, "hello!");
    }

    #[tokio::test]
    async fn test_connect_sends_join_then_replays_queue() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        client.insert(0, "offline edit").await.unwrap();

        let (transport, mut sent_rx, _in_tx) = ChannelTransport::pair();
        client.connect(transport).await.unwrap();

        let join = timeout(Duration::from_secs(1), sent_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let join: Value = serde_json::from_str(&join).unwrap();
        assert_eq!(join["type"], "join_document");
        assert_eq!(join["documentId"], "doc-1");
        assert_eq!(join["userName"], "Alice");

        let replayed = timeout(Duration::from_secs(1), sent_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let replayed: Value = serde_json::from_str(&replayed).unwrap();
        assert_eq!(replayed["type"], "operation");
        assert_eq!(replayed["operation"]["content"], "offline edit");
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_document_state_adopts_content() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        let (transport, _sent_rx, in_tx) = ChannelTransport::pair();
        let mut events = client.take_event_rx().unwrap();
        client.connect(transport).await.unwrap();

        // Connected event first.
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ClientEvent::Connected) => {}
            other => panic!("expected Connected, got {other:?}"),
        }

        let frame = json!({
            "type": "document_state",
            "data": { "documentId": "doc-1", "content": "hello", "version": 7, "siteId": 3, "users": [] },
            "timestamp": Utc::now(),
        })
        .to_string();
        in_tx.send(frame).await.unwrap();

        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ClientEvent::ContentChanged { content }) => assert_eq!(content, "hello"),
            other => panic!("expected ContentChanged, got {other:?}"),
        }
        assert_eq!(client.content().await, "hello");
    }

    #[tokio::test]
    async fn test_remote_operation_applies_to_replica() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        let (transport, _sent_rx, in_tx) = ChannelTransport::pair();
        let mut events = client.take_event_rx().unwrap();
        client.connect(transport).await.unwrap();
        let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

        let frame = json!({
            "type": "operation_received",
            "userId": "u2",
            "data": { "operation": {
                "type": "insert",
                "position": 0,
                "userId": "u2",
                "content": "abc",
                "operationId": uuid::Uuid::new_v4().to_string(),
                "timestamp": Utc::now(),
                "site": 2,
                "lamport": 1,
            }},
            "timestamp": Utc::now(),
        })
        .to_string();
        in_tx.send(frame).await.unwrap();

        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ClientEvent::ContentChanged { content }) => assert_eq!(content, "abc"),
            other => panic!("expected ContentChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_frame_surfaces_as_event() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        let (transport, _sent_rx, in_tx) = ChannelTransport::pair();
        let mut events = client.take_event_rx().unwrap();
        client.connect(transport).await.unwrap();
        let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

        let frame = json!({
            "type": "error",
            "data": { "error": "missing required field: userId" },
            "timestamp": Utc::now(),
        })
        .to_string();
        in_tx.send(frame).await.unwrap();

        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ClientEvent::Error { message }) => {
                assert_eq!(message, "missing required field: userId");
            }
            other => panic!("expected Error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_disconnect_emits_event() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        let (transport, _sent_rx, in_tx) = ChannelTransport::pair();
        let mut events = client.take_event_rx().unwrap();
        client.connect(transport).await.unwrap();
        let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

        drop(in_tx);
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ClientEvent::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = CollabClient::new("u1", "Alice", "doc-1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
