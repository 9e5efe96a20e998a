//! Per-document session coordination.
//!
//! One [`DocumentSession`] per document. All state transitions (text
//! merge, awareness updates, peer set changes) run inside one critical
//! section per document, so per-document linearizability holds; different
//! documents lock independently and run in parallel.
//!
//! ```text
//! connection task ──► DocumentSession::submit_op ──┐
//!                                                  │ (single writer)
//!                     ReplicatedText::apply_remote ◄┘
//!                                │
//!                     fan-out to every *other* peer's outbound queue
//! ```
//!
//! Peers hold connection ids and channel handles into the session, never
//! direct aliases of the text. The submitter never receives its own echo:
//! exclusion happens at enqueue time, not at delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, AwarenessRegistry};
use crate::crdt::{CrdtError, ReplicatedText, SiteId};
use crate::protocol::{ProtocolError, ServerEvent, UserInfo, WireOperation};

/// Locally unique handle for a transport connection.
pub type ConnectionId = Uuid;

/// What the supervisor's writer task pulls off a connection's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized JSON frame.
    Frame(String),
    /// Close the connection with the given status code and reason.
    Close { code: u16, reason: String },
}

/// Error taxonomy for session operations.
///
/// Validation and structural errors are recovered locally with an `error`
/// reply; `InternalMerge` is fatal to the session (its connections close
/// with 1011) but never to the process.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("not joined to a document")]
    NotJoined,
    #[error("already joined to a document")]
    AlreadyJoined,
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("document not found")]
    DocumentNotFound,
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    #[error("internal merge failure: {0}")]
    InternalMerge(String),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::MalformedFrame(m) => Self::MalformedFrame(m),
            ProtocolError::UnknownMessageType(m) => Self::UnknownMessageType(m),
            ProtocolError::MissingField(m) => Self::MissingField(m),
            ProtocolError::InvalidOperation(m) => Self::InvalidOperation(m),
        }
    }
}

/// Per-document counters reported by `get_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMetrics {
    #[serde(rename = "totalOps")]
    pub total_ops: u64,
    #[serde(rename = "peakPeers")]
    pub peak_peers: usize,
    #[serde(rename = "activeConns")]
    pub active_conns: usize,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
    pub size: usize,
}

/// What a joining connection gets back.
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub content: String,
    pub version: u64,
    pub site: SiteId,
    /// Distinct peers already in the document (the joiner excluded).
    pub users: Vec<UserInfo>,
    pub awareness: Vec<AwarenessEntry>,
}

/// A connection's membership in a session.
#[derive(Debug, Clone)]
struct PeerBinding {
    peer_id: String,
    display_name: String,
    site: SiteId,
    outbound: mpsc::Sender<Outbound>,
}

#[derive(Debug)]
struct SessionState {
    text: ReplicatedText,
    awareness: AwarenessRegistry,
    peers: HashMap<ConnectionId, PeerBinding>,
    /// Connections whose queues overflowed or closed; reaped after fan-out.
    dead: Vec<ConnectionId>,
    next_site: u64,
    total_ops: u64,
    peak_peers: usize,
    last_activity: DateTime<Utc>,
    empty_since: Option<Instant>,
    detached: bool,
}

impl SessionState {
    /// Enqueue a frame to every peer except `exclude`. Full or closed
    /// queues mark the connection dead; it is reaped afterwards.
    fn fan_out(&mut self, frame: &str, exclude: Option<ConnectionId>) {
        for (id, binding) in &self.peers {
            if Some(*id) == exclude {
                continue;
            }
            if binding
                .outbound
                .try_send(Outbound::Frame(frame.to_owned()))
                .is_err()
            {
                self.dead.push(*id);
            }
        }
    }

    /// Remove dead connections, with leave bookkeeping for each. A
    /// `user_left` fan-out may mark further connections dead, so this
    /// loops until the list drains.
    fn reap_dead(&mut self, now: DateTime<Utc>) {
        while let Some(id) = self.dead.pop() {
            let Some(binding) = self.peers.remove(&id) else {
                continue;
            };
            log::warn!(
                "dropping connection {id} of peer {}: outbound queue unavailable",
                binding.peer_id
            );
            self.offline_if_last(&binding.peer_id, now);
        }
        if self.peers.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
    }

    /// Mark the peer offline and announce `user_left` once its final
    /// connection is gone; a peer may hold several connections.
    fn offline_if_last(&mut self, peer_id: &str, now: DateTime<Utc>) {
        if self.peers.values().any(|b| b.peer_id == peer_id) {
            return;
        }
        self.awareness.mark_offline(peer_id, now);
        let frame = ServerEvent::UserLeft {
            user_id: peer_id.to_string(),
        }
        .to_frame();
        self.fan_out(&frame, None);
    }

    /// Distinct users currently bound, minus `exclude_peer`.
    fn user_infos(&self, exclude_peer: Option<&str>) -> Vec<UserInfo> {
        let mut seen = Vec::new();
        let mut users = Vec::new();
        for binding in self.peers.values() {
            if Some(binding.peer_id.as_str()) == exclude_peer
                || seen.contains(&binding.peer_id)
            {
                continue;
            }
            seen.push(binding.peer_id.clone());
            users.push(UserInfo {
                id: binding.peer_id.clone(),
                name: binding.display_name.clone(),
                color: self.awareness.color_for(&binding.peer_id).to_string(),
            });
        }
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }
}

/// In-memory coordination object owning one document's replicated text
/// and connected peers.
#[derive(Debug)]
pub struct DocumentSession {
    doc_id: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl DocumentSession {
    pub fn new(doc_id: impl Into<String>, palette: Vec<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                text: ReplicatedText::new(SiteId(0)),
                awareness: AwarenessRegistry::new(palette),
                peers: HashMap::new(),
                dead: Vec::new(),
                next_site: 1,
                total_ops: 0,
                peak_peers: 0,
                last_activity: Utc::now(),
                empty_since: None,
                detached: false,
            }),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Register a connection, allocate its site, and announce the join.
    pub async fn join(
        &self,
        conn_id: ConnectionId,
        peer_id: &str,
        display_name: &str,
        outbound: mpsc::Sender<Outbound>,
        max_peers: usize,
    ) -> Result<JoinResult, SessionError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.detached {
            return Err(SessionError::DocumentNotFound);
        }
        if state.peers.contains_key(&conn_id) {
            return Err(SessionError::AlreadyJoined);
        }
        if state.peers.len() >= max_peers {
            return Err(SessionError::Capacity(format!(
                "document {} is full ({max_peers} peers)",
                self.doc_id
            )));
        }

        // Snapshot the room as it looked before this peer appeared.
        let users = state.user_infos(Some(peer_id));

        let site = SiteId(state.next_site);
        state.next_site += 1;
        state.peers.insert(
            conn_id,
            PeerBinding {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
                site,
                outbound,
            },
        );
        state.empty_since = None;
        let distinct = state.user_infos(None).len();
        state.peak_peers = state.peak_peers.max(distinct);
        state.last_activity = now;
        state.awareness.join(peer_id, display_name, now);

        let frame = ServerEvent::UserJoined {
            user: UserInfo {
                id: peer_id.to_string(),
                name: display_name.to_string(),
                color: state.awareness.color_for(peer_id).to_string(),
            },
        }
        .to_frame();
        state.fan_out(&frame, Some(conn_id));
        state.reap_dead(now);

        log::info!(
            "peer {peer_id} ({display_name}) joined doc {} as {site}",
            self.doc_id
        );

        Ok(JoinResult {
            content: state.text.content(),
            version: state.total_ops,
            site,
            users,
            awareness: state.awareness.entries(),
        })
    }

    /// Remove a connection binding; announces `user_left` when the peer's
    /// last connection departs.
    pub async fn leave(&self, conn_id: ConnectionId) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(binding) = state.peers.remove(&conn_id) else {
            return;
        };
        log::info!("peer {} left doc {}", binding.peer_id, self.doc_id);
        state.offline_if_last(&binding.peer_id, now);
        state.reap_dead(now);
        state.last_activity = now;
    }

    /// Apply a submitted operation and fan it out to the other peers.
    ///
    /// Returns `Ok(false)` for duplicates: no broadcast, no change.
    pub async fn submit_op(
        &self,
        conn_id: ConnectionId,
        wire: &WireOperation,
    ) -> Result<bool, SessionError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let binding = state
            .peers
            .get(&conn_id)
            .cloned()
            .ok_or(SessionError::NotJoined)?;

        let op = wire.to_operation(binding.site, state.text.clock() + 1);
        let applied = match state.text.apply_remote(&op) {
            Ok(applied) => applied,
            Err(CrdtError::MalformedOperation(m)) => {
                return Err(SessionError::InvalidOperation(m));
            }
            Err(e) => {
                // A merge invariant broke: detach this session, close its
                // connections, leave every other document untouched.
                log::error!(
                    "internal merge failure in doc {}: op {op:?}: {e}",
                    self.doc_id
                );
                state.detached = true;
                for binding in state.peers.values() {
                    let _ = binding.outbound.try_send(Outbound::Close {
                        code: 1011,
                        reason: "Internal merge failure".into(),
                    });
                }
                state.peers.clear();
                return Err(SessionError::InternalMerge(e.to_string()));
            }
        };

        if !applied {
            log::debug!("duplicate op {} ignored in doc {}", wire.operation_id, self.doc_id);
            return Ok(false);
        }

        state.total_ops += 1;
        state.last_activity = now;
        state.awareness.touch(&binding.peer_id, now);

        let frame = ServerEvent::OperationReceived {
            operation: WireOperation::from_operation(&op, &binding.peer_id, wire.timestamp),
        }
        .to_frame();
        state.fan_out(&frame, Some(conn_id));
        state.reap_dead(now);
        Ok(true)
    }

    /// Record a cursor move and fan out `cursor_changed`.
    pub async fn update_cursor(
        &self,
        conn_id: ConnectionId,
        position: u32,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let binding = state
            .peers
            .get(&conn_id)
            .cloned()
            .ok_or(SessionError::NotJoined)?;
        let len = state.text.len() as u32;
        let diff = state
            .awareness
            .update_cursor(&binding.peer_id, position, len, now);
        if let Some(entry) = diff.updated.first() {
            if let Some(cursor) = entry.cursor {
                let frame = ServerEvent::CursorChanged {
                    user_id: binding.peer_id.clone(),
                    cursor,
                }
                .to_frame();
                state.fan_out(&frame, Some(conn_id));
                state.reap_dead(now);
            }
        }
        state.last_activity = now;
        Ok(())
    }

    /// Record a selection change and fan out `selection_changed`.
    pub async fn update_selection(
        &self,
        conn_id: ConnectionId,
        start: u32,
        end: u32,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let binding = state
            .peers
            .get(&conn_id)
            .cloned()
            .ok_or(SessionError::NotJoined)?;
        let len = state.text.len() as u32;
        let diff = state
            .awareness
            .update_selection(&binding.peer_id, start, end, len, now);
        if let Some(entry) = diff.updated.first() {
            if let Some(selection) = entry.selection {
                let frame = ServerEvent::SelectionChanged {
                    user_id: binding.peer_id.clone(),
                    selection,
                }
                .to_frame();
                state.fan_out(&frame, Some(conn_id));
                state.reap_dead(now);
            }
        }
        state.last_activity = now;
        Ok(())
    }

    /// Refresh activity bookkeeping for any traffic on a connection.
    pub async fn touch(&self, conn_id: ConnectionId) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(binding) = state.peers.get(&conn_id) {
            let peer = binding.peer_id.clone();
            state.awareness.touch(&peer, now);
            state.last_activity = now;
        }
    }

    pub async fn metrics(&self) -> DocMetrics {
        let state = self.state.lock().await;
        DocMetrics {
            total_ops: state.total_ops,
            peak_peers: state.peak_peers,
            active_conns: state.peers.len(),
            last_activity: state.last_activity,
            size: state.text.len(),
        }
    }

    /// Current content + users, for `get_document_state`.
    pub async fn document_state(&self, conn_id: ConnectionId) -> Result<ServerEvent, SessionError> {
        let state = self.state.lock().await;
        let binding = state.peers.get(&conn_id).ok_or(SessionError::NotJoined)?;
        Ok(ServerEvent::DocumentState {
            document_id: self.doc_id.clone(),
            content: state.text.content(),
            version: state.total_ops,
            site: binding.site,
            users: state.user_infos(None),
        })
    }

    /// Awareness timeout pass; broadcasts `presence_info` when anything
    /// went offline or was evicted.
    pub async fn sweep_awareness(&self, stale_ms: u64, evict_ms: u64) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let diff = state.awareness.sweep(now, stale_ms, evict_ms);
        if !diff.is_empty() {
            let frame = ServerEvent::PresenceInfo {
                users: state.awareness.entries(),
            }
            .to_frame();
            state.fan_out(&frame, None);
            state.reap_dead(now);
        }
    }

    /// Close every connection (server shutdown, code 1001).
    pub async fn close_all(&self, code: u16, reason: &str) {
        let mut state = self.state.lock().await;
        for binding in state.peers.values() {
            let _ = binding.outbound.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        state.peers.clear();
        state.empty_since = Some(Instant::now());
    }

    /// True when the session has been empty for at least `delay`.
    pub async fn reclaimable(&self, delay: Duration) -> bool {
        let state = self.state.lock().await;
        if !state.peers.is_empty() {
            return false;
        }
        match state.empty_since {
            Some(since) => since.elapsed() >= delay,
            // Never-joined sessions are reclaimable immediately.
            None => true,
        }
    }

    pub async fn is_detached(&self) -> bool {
        self.state.lock().await.detached
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Current materialized content (snapshot string; no aliasing).
    pub async fn content(&self) -> String {
        self.state.lock().await.text.content()
    }

    /// Opaque snapshot of the replicated text plus its JSON sidecar.
    pub async fn snapshot(&self) -> Result<(Vec<u8>, String), SessionError> {
        let state = self.state.lock().await;
        let blob = state
            .text
            .snapshot()
            .map_err(|e| SessionError::InternalMerge(e.to_string()))?;
        let sidecar = state.text.sidecar(&self.doc_id);
        let sidecar_json = serde_json::to_string(&sidecar)
            .map_err(|e| SessionError::InternalMerge(e.to_string()))?;
        Ok((blob, sidecar_json))
    }
}

/// Global `doc_id → session` table. The lock is held only for lookups and
/// lifecycle; sessions themselves are reached through the `Arc` without it.
pub struct SessionMap {
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
    palette: Vec<String>,
    max_sessions: usize,
}

impl SessionMap {
    pub fn new(palette: Vec<String>, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            palette,
            max_sessions,
        }
    }

    /// Session for `doc_id`, created on first join.
    pub async fn get_or_create(
        &self,
        doc_id: &str,
    ) -> Result<Arc<DocumentSession>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(doc_id) {
            return Ok(session.clone());
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::Capacity(format!(
                "session limit reached ({})",
                self.max_sessions
            )));
        }
        let session = Arc::new(DocumentSession::new(doc_id, self.palette.clone()));
        sessions.insert(doc_id.to_string(), session.clone());
        log::info!("created session for doc {doc_id}");
        Ok(session)
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.lock().await.get(doc_id).cloned()
    }

    pub async fn remove(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.lock().await.remove(doc_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Drop sessions that have been empty for at least `delay`, plus any
    /// detached by an internal merge failure. Returns the reclaimed ids.
    pub async fn cleanup(&self, delay: Duration) -> Vec<String> {
        let snapshot: Vec<(String, Arc<DocumentSession>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut reclaimed = Vec::new();
        for (doc_id, session) in snapshot {
            if session.is_detached().await || session.reclaimable(delay).await {
                reclaimed.push(doc_id);
            }
        }
        if !reclaimed.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for doc_id in &reclaimed {
                // Re-check under the lock: a join may have raced the sweep.
                let still_empty = match sessions.get(doc_id) {
                    Some(s) => s.peer_count().await == 0 || s.is_detached().await,
                    None => false,
                };
                if still_empty {
                    sessions.remove(doc_id);
                    log::info!("session {doc_id} reclaimed (empty)");
                }
            }
            reclaimed.retain(|id| !sessions.contains_key(id));
        }
        reclaimed
    }
}
