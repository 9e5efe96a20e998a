//! # coedit — Real-time collaborative plain-text editing
//!
//! Multiple remote participants edit a shared text buffer concurrently;
//! the service guarantees convergence regardless of network interleaving,
//! reports live presence (cursors, selections, joins/leaves), and tolerates
//! disconnection without data loss.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ CollabClient │ ◄──────────────► │ CollabServer │
//! │ (per user)   │   framed JSON    │ (supervisor) │
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │ route by document
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────────┐
//! │ReplicatedText│                  │ DocumentSession  │
//! │ (local)      │                  │ (single writer)  │
//! └──────────────┘                  └──────┬───────────┘
//!                                          │
//!                              ┌───────────┴───────────┐
//!                              │ ReplicatedText        │
//!                              │ AwarenessRegistry     │
//!                              │ fan-out to N-1 peers  │
//!                              └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — Replicated text with vector-clock causality and tombstones
//! - [`transform`] — Operational transformation for position rebasing
//! - [`awareness`] — Per-document presence registry (cursors, selections)
//! - [`session`] — Per-document coordinator: apply, track, fan out
//! - [`server`] — WebSocket connection supervisor with stale eviction
//! - [`protocol`] — Framed JSON message schema and validation
//! - [`client`] — Embedded sync client with event channel and offline queue

pub mod awareness;
pub mod client;
pub mod crdt;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transform;

pub use awareness::{AwarenessDiff, AwarenessEntry, AwarenessRegistry, CursorState, SelectionState};
pub use client::{ClientEvent, CollabClient, ConnectionState, OfflineQueue, Transport, WsTransport};
pub use crdt::{CrdtError, OpKind, Operation, ReplicatedText, SiteId, SnapshotSidecar, VectorClock};
pub use protocol::{ClientMessage, ProtocolError, ServerEvent, UserInfo, WireOperation};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{
    ConnectionId, DocMetrics, DocumentSession, JoinResult, Outbound, SessionError, SessionMap,
};
pub use transform::{transform, transform_all};
