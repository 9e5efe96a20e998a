//! WebSocket connection supervisor.
//!
//! Architecture:
//! ```text
//! Peer A ──┐
//!           ├── CollabServer ── SessionMap ── DocumentSession (doc_id)
//! Peer B ──┘        │                              │
//!                   │ frame decode (protocol)      │ apply + fan-out
//!                   │                              ▼
//!                   └── per-connection task ◄── bounded outbound queue
//! ```
//!
//! Each accepted connection gets a fresh [`ConnectionId`], a bounded
//! outbound queue, and one task that multiplexes inbound frames, queued
//! fan-out, the health check, and shutdown. Messages before
//! `join_document` are rejected except `ping`; connections silent past
//! the evict threshold are closed with code 1001.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{error_frame, ClientMessage, ServerEvent};
use crate::session::{
    ConnectionId, DocumentSession, Outbound, SessionError, SessionMap,
};

/// Server configuration. Thresholds are milliseconds.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Send a keepalive after this much connection silence.
    pub stale_threshold_ms: u64,
    /// Close a connection after this much silence.
    pub evict_threshold_ms: u64,
    /// Keep empty document sessions around this long before teardown.
    pub session_cleanup_delay_ms: u64,
    /// Hex colors assigned to peers by id hash; empty uses the default
    /// palette.
    pub user_color_palette: Vec<String>,
    /// Inbound frame hard limit; oversize closes the connection.
    pub max_frame_bytes: usize,
    pub max_concurrent_sessions: usize,
    pub max_peers_per_session: usize,
    /// Bounded per-connection outbound queue; overflow drops the peer.
    pub send_buffer: usize,
    /// Cadence of the health check and the session janitor.
    pub health_check_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            stale_threshold_ms: 30_000,
            evict_threshold_ms: 60_000,
            session_cleanup_delay_ms: 0,
            user_color_palette: Vec::new(),
            max_frame_bytes: 1024 * 1024,
            max_concurrent_sessions: 1024,
            max_peers_per_session: 100,
            send_buffer: 256,
            health_check_interval_ms: 30_000,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    sessions: Arc<SessionMap>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionMap::new(
            config.user_color_palette.clone(),
            config.max_concurrent_sessions,
        ));
        Self {
            config,
            sessions,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn sessions(&self) -> &Arc<SessionMap> {
        &self.sessions
    }

    /// Server statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.sessions.len().await;
        stats
    }

    /// Accept loop plus janitor. Runs until [`CollabServer::shutdown`].
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        let mut janitor =
            tokio::time::interval(Duration::from_millis(self.config.health_check_interval_ms));
        janitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    if self.shutting_down.load(Ordering::SeqCst) {
                        continue;
                    }
                    log::debug!("new TCP connection from {addr}");
                    let sessions = self.sessions.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, config, sessions, stats, shutdown).await
                        {
                            log::error!("connection error from {addr}: {e}");
                        }
                    });
                }

                _ = janitor.tick() => {
                    self.run_janitor().await;
                }

                _ = self.shutdown.notified() => {
                    log::info!("accept loop stopped (shutdown)");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Awareness timeout sweep plus empty-session teardown.
    async fn run_janitor(&self) {
        let stale = self.config.stale_threshold_ms;
        let evict = self.config.evict_threshold_ms;
        for doc_id in self.sessions.document_ids().await {
            if let Some(session) = self.sessions.get(&doc_id).await {
                session.sweep_awareness(stale, evict).await;
            }
        }
        let reclaimed = self
            .sessions
            .cleanup(Duration::from_millis(self.config.session_cleanup_delay_ms))
            .await;
        if !reclaimed.is_empty() {
            log::debug!("janitor reclaimed {} session(s)", reclaimed.len());
        }
    }

    /// Close every connection with code 1001 and drain sessions.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("server shutting down");
        self.shutdown.notify_waiters();
        for doc_id in self.sessions.document_ids().await {
            if let Some(session) = self.sessions.get(&doc_id).await {
                session.close_all(1001, "Server shutting down").await;
            }
            self.sessions.remove(&doc_id).await;
        }
    }
}

/// Peer lifecycle on one connection.
///
/// ```text
/// (accept) ─► Connected ─join─► Joined ──► Active ◄──► Idle ──► evicted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connected,
    Joined,
    Active,
    Idle,
}

async fn handle_connection(
    stream: TcpStream,
    config: ServerConfig,
    sessions: Arc<SessionMap>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: Arc<Notify>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id: ConnectionId = Uuid::new_v4();
    log::info!("connection {conn_id} established");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Bounded outbound queue. The session holds the only long-lived
    // sender after join, so a closed queue means the session dropped us.
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(config.send_buffer);
    let mut local_tx = Some(out_tx);

    let mut joined: Option<Arc<DocumentSession>> = None;
    let mut peer_state = PeerState::Connected;
    let mut last_activity = Instant::now();
    let stale = Duration::from_millis(config.stale_threshold_ms);
    let evict = Duration::from_millis(config.evict_threshold_ms);
    let mut health = tokio::time::interval(Duration::from_millis(config.health_check_interval_ms));
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        last_activity = Instant::now();
                        if peer_state != PeerState::Connected {
                            peer_state = PeerState::Active;
                        }

                        if text.len() > config.max_frame_bytes {
                            log::warn!(
                                "connection {conn_id}: frame of {} bytes exceeds limit",
                                text.len()
                            );
                            send_close(&mut ws_sender, 1009, "Frame too large").await;
                            break;
                        }

                        match ClientMessage::decode(&text) {
                            Ok(message) => {
                                let reply = dispatch(
                                    message,
                                    conn_id,
                                    &sessions,
                                    &config,
                                    &mut joined,
                                    &mut peer_state,
                                    &mut local_tx,
                                )
                                .await;
                                for frame in reply {
                                    ws_sender.send(Message::Text(frame.into())).await?;
                                }
                            }
                            Err(e) => {
                                log::debug!("connection {conn_id}: rejected frame: {e}");
                                ws_sender
                                    .send(Message::Text(error_frame(&e.to_string()).into()))
                                    .await?;
                            }
                        }
                    }

                    Some(Ok(Message::Binary(_))) => {
                        ws_sender
                            .send(Message::Text(
                                error_frame("malformed frame: expected a JSON text frame").into(),
                            ))
                            .await?;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                        if peer_state == PeerState::Idle {
                            peer_state = PeerState::Active;
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection {conn_id} closed by peer");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("connection {conn_id}: transport error: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            queued = out_rx.recv() => {
                match queued {
                    Some(Outbound::Frame(frame)) => {
                        ws_sender.send(Message::Text(frame.into())).await?;
                    }
                    Some(Outbound::Close { code, reason }) => {
                        log::info!("connection {conn_id} closing: {reason} ({code})");
                        send_close(&mut ws_sender, code, &reason).await;
                        break;
                    }
                    None => {
                        // The session dropped our queue (overflow reap).
                        send_close(&mut ws_sender, 1008, "Send buffer overflow").await;
                        break;
                    }
                }
            }

            _ = health.tick() => {
                let idle = last_activity.elapsed();
                if idle >= evict {
                    log::info!("connection {conn_id} evicted after {idle:?} of silence");
                    send_close(&mut ws_sender, 1001, "Connection timeout").await;
                    break;
                }
                if idle >= stale {
                    peer_state = PeerState::Idle;
                    let _ = ws_sender.send(Message::Ping(Vec::new().into())).await;
                }
            }

            _ = shutdown.notified() => {
                send_close(&mut ws_sender, 1001, "Server shutting down").await;
                break;
            }
        }
    }

    if let Some(session) = joined.take() {
        session.leave(conn_id).await;
        sessions
            .cleanup(Duration::from_millis(config.session_cleanup_delay_ms))
            .await;
    }

    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    log::info!("connection {conn_id} finished");
    Ok(())
}

async fn send_close<S>(ws_sender: &mut S, code: u16, reason: &str)
where
    S: SinkExt<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
}

/// Route one validated message. Returns frames to send back on this
/// connection; fan-out to other peers happens inside the session.
async fn dispatch(
    message: ClientMessage,
    conn_id: ConnectionId,
    sessions: &Arc<SessionMap>,
    config: &ServerConfig,
    joined: &mut Option<Arc<DocumentSession>>,
    peer_state: &mut PeerState,
    local_tx: &mut Option<mpsc::Sender<Outbound>>,
) -> Vec<String> {
    match message {
        ClientMessage::JoinDocument {
            user_id,
            document_id,
            user_name,
        } => {
            if joined.is_some() {
                return vec![error_frame(&SessionError::AlreadyJoined.to_string())];
            }
            let Some(out_tx) = local_tx.clone() else {
                return vec![error_frame(&SessionError::AlreadyJoined.to_string())];
            };
            let session = match sessions.get_or_create(&document_id).await {
                Ok(session) => session,
                Err(e) => return vec![error_frame(&e.to_string())],
            };
            match session
                .join(conn_id, &user_id, &user_name, out_tx, config.max_peers_per_session)
                .await
            {
                Ok(result) => {
                    *joined = Some(session);
                    *peer_state = PeerState::Joined;
                    // Hand the queue to the session; a closed queue now
                    // means we were dropped from it.
                    *local_tx = None;
                    vec![
                        ServerEvent::DocumentState {
                            document_id,
                            content: result.content,
                            version: result.version,
                            site: result.site,
                            users: result.users,
                        }
                        .to_frame(),
                        ServerEvent::PresenceInfo {
                            users: result.awareness,
                        }
                        .to_frame(),
                    ]
                }
                Err(e) => vec![error_frame(&e.to_string())],
            }
        }

        ClientMessage::Operation(wire) => match joined.as_ref() {
            Some(session) => match session.submit_op(conn_id, &wire).await {
                Ok(_) => Vec::new(),
                Err(e @ SessionError::InternalMerge(_)) => {
                    // Session detached itself; drop it from the table.
                    let doc_id = session.doc_id().to_string();
                    sessions.remove(&doc_id).await;
                    *joined = None;
                    vec![error_frame(&e.to_string())]
                }
                Err(e) => vec![error_frame(&e.to_string())],
            },
            None => vec![error_frame(&SessionError::NotJoined.to_string())],
        },

        ClientMessage::CursorUpdate { position } => match joined.as_ref() {
            Some(session) => match session.update_cursor(conn_id, position).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_frame(&e.to_string())],
            },
            None => vec![error_frame(&SessionError::NotJoined.to_string())],
        },

        ClientMessage::SelectionUpdate { start, end } => match joined.as_ref() {
            Some(session) => match session.update_selection(conn_id, start, end).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_frame(&e.to_string())],
            },
            None => vec![error_frame(&SessionError::NotJoined.to_string())],
        },

        // Ping is the one message allowed before join.
        ClientMessage::Ping => {
            if let Some(session) = joined.as_ref() {
                session.touch(conn_id).await;
            }
            vec![ServerEvent::Pong.to_frame()]
        }

        ClientMessage::GetMetrics => match joined.as_ref() {
            Some(session) => {
                let metrics = session.metrics().await;
                vec![ServerEvent::Metrics { metrics }.to_frame()]
            }
            None => vec![error_frame(&SessionError::NotJoined.to_string())],
        },

        ClientMessage::GetDocumentState => match joined.as_ref() {
            Some(session) => match session.document_state(conn_id).await {
                Ok(event) => vec![event.to_frame()],
                Err(e) => vec![error_frame(&e.to_string())],
            },
            None => vec![error_frame(&SessionError::NotJoined.to_string())],
        },
    }
}
