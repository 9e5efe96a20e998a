//! Framed JSON wire protocol.
//!
//! One JSON object per WebSocket text frame, both directions. This module
//! is the single place that inspects the `type` tag and each variant's
//! required fields; everything downstream works with the tagged sum types.
//!
//! Client → server: `join_document`, `operation`, `cursor_update`,
//! `selection_update`, `ping`, `get_metrics`, `get_document_state`.
//!
//! Server → client envelope:
//! ```text
//! { "type": <event>, "data": {...}, "userId"?: <peer>, "timestamp": <ISO-8601> }
//! ```
//!
//! Validation failures produce an `error` reply and never close the
//! connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, CursorState, SelectionState};
use crate::crdt::{OpKind, Operation, SiteId};
use crate::session::DocMetrics;

/// Frame validation errors. Recovered locally with an `error` reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Operation payload as carried on the wire.
///
/// `site` and `lamport` are optional: peers that track their own replica
/// send them; position-only peers omit them and the coordinator stamps
/// the operation with the connection's site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: u32,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(rename = "operationId")]
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lamport: Option<u64>,
}

impl WireOperation {
    /// Build the CRDT operation, stamping defaults for position-only peers.
    pub fn to_operation(&self, default_site: SiteId, default_lamport: u64) -> Operation {
        Operation {
            kind: self.kind,
            position: self.position,
            content: self.content.clone(),
            length: self.length,
            site: self.site.map(SiteId).unwrap_or(default_site),
            lamport: self.lamport.unwrap_or(default_lamport),
            op_id: op_uuid(&self.operation_id),
        }
    }

    /// Wire form of an applied operation, for `operation_received` fan-out.
    pub fn from_operation(op: &Operation, user_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: op.kind,
            position: op.position,
            user_id: user_id.to_string(),
            content: op.content.clone(),
            length: op.length,
            operation_id: op.op_id.to_string(),
            timestamp,
            site: Some(op.site.0),
            lamport: Some(op.lamport),
        }
    }
}

/// Deterministic uuid for an arbitrary wire operation id, so duplicate
/// suppression works even for peers that send non-uuid ids.
fn op_uuid(id: &str) -> Uuid {
    Uuid::parse_str(id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()))
}

/// Peer identity as reported in `document_state` and `user_joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Inbound message, decoded and field-validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinDocument {
        user_id: String,
        document_id: String,
        user_name: String,
    },
    Operation(WireOperation),
    CursorUpdate {
        position: u32,
    },
    SelectionUpdate {
        start: u32,
        end: u32,
    },
    Ping,
    GetMetrics,
    GetDocumentState,
}

impl ClientMessage {
    /// Parse and validate one inbound frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedFrame("frame must be a JSON object".into()))?;
        let msg_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame("frame requires a string `type`".into()))?;

        match msg_type {
            "join_document" => Ok(Self::JoinDocument {
                user_id: required_str(obj, "userId")?,
                document_id: required_str(obj, "documentId")?,
                user_name: required_str(obj, "userName")?,
            }),
            "operation" => {
                let op = obj
                    .get("operation")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ProtocolError::MissingField("operation".into()))?;
                Ok(Self::Operation(decode_operation(op)?))
            }
            "cursor_update" => {
                let cursor = obj
                    .get("cursor")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ProtocolError::MissingField("cursor".into()))?;
                Ok(Self::CursorUpdate {
                    position: required_u32(cursor, "position", "cursor.position")?,
                })
            }
            "selection_update" => {
                let selection = obj
                    .get("selection")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ProtocolError::MissingField("selection".into()))?;
                Ok(Self::SelectionUpdate {
                    start: required_u32(selection, "start", "selection.start")?,
                    end: required_u32(selection, "end", "selection.end")?,
                })
            }
            "ping" => Ok(Self::Ping),
            "get_metrics" => Ok(Self::GetMetrics),
            "get_document_state" => Ok(Self::GetDocumentState),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

fn required_str(
    obj: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<String, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MissingField(field.into()))
}

/// Positions must be finite integers; JSON floats are rejected rather
/// than coerced. Negative positions are clamped to 0 silently, the same
/// way oversized positions clamp to the text length downstream.
fn required_u32(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<u32, ProtocolError> {
    let value = obj
        .get(field)
        .ok_or_else(|| ProtocolError::MissingField(label.into()))?;
    let int = value.as_i64().ok_or_else(|| {
        ProtocolError::InvalidOperation(format!("{label} must be a finite integer"))
    })?;
    Ok(int.clamp(0, i64::from(u32::MAX)) as u32)
}

fn decode_operation(op: &serde_json::Map<String, Value>) -> Result<WireOperation, ProtocolError> {
    let kind = match op.get("type").and_then(Value::as_str) {
        Some("insert") => OpKind::Insert,
        Some("delete") => OpKind::Delete,
        Some("retain") => OpKind::Retain,
        Some(other) => {
            return Err(ProtocolError::InvalidOperation(format!(
                "unknown operation type: {other}"
            )))
        }
        None => return Err(ProtocolError::MissingField("operation.type".into())),
    };
    let position = required_u32(op, "position", "operation.position")?;
    let user_id = op
        .get("userId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MissingField("operation.userId".into()))?;
    let operation_id = op
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MissingField("operation.operationId".into()))?;
    let timestamp = op
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MissingField("operation.timestamp".into()))?
        .parse::<DateTime<Utc>>()
        .map_err(|e| ProtocolError::InvalidOperation(format!("bad timestamp: {e}")))?;
    let content = op.get("content").and_then(Value::as_str).map(str::to_string);
    let length = op
        .get("length")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok());
    let site = op.get("site").and_then(Value::as_u64);
    let lamport = op.get("lamport").and_then(Value::as_u64);

    Ok(WireOperation {
        kind,
        position,
        user_id,
        content,
        length,
        operation_id,
        timestamp,
        site,
        lamport,
    })
}

/// Outbound event, encoded into the `{type, data, userId?, timestamp}`
/// envelope by [`ServerEvent::to_frame`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    DocumentState {
        document_id: String,
        content: String,
        version: u64,
        site: SiteId,
        users: Vec<UserInfo>,
    },
    PresenceInfo {
        users: Vec<AwarenessEntry>,
    },
    UserJoined {
        user: UserInfo,
    },
    UserLeft {
        user_id: String,
    },
    CursorChanged {
        user_id: String,
        cursor: CursorState,
    },
    SelectionChanged {
        user_id: String,
        selection: SelectionState,
    },
    OperationReceived {
        operation: WireOperation,
    },
    Metrics {
        metrics: DocMetrics,
    },
    Pong,
    Error {
        error: String,
    },
}

impl ServerEvent {
    /// The envelope `type` tag.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::DocumentState { .. } => "document_state",
            Self::PresenceInfo { .. } => "presence_info",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::CursorChanged { .. } => "cursor_changed",
            Self::SelectionChanged { .. } => "selection_changed",
            Self::OperationReceived { .. } => "operation_received",
            Self::Metrics { .. } => "metrics",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::DocumentState {
                document_id,
                content,
                version,
                site,
                users,
            } => json!({
                "documentId": document_id,
                "content": content,
                "version": version,
                "siteId": site.0,
                "users": users,
            }),
            Self::PresenceInfo { users } => json!({ "users": users }),
            Self::UserJoined { user } => json!({ "user": user }),
            Self::UserLeft { user_id } => json!({ "userId": user_id }),
            Self::CursorChanged { user_id, cursor } => json!({
                "userId": user_id,
                "cursor": cursor,
            }),
            Self::SelectionChanged { user_id, selection } => json!({
                "userId": user_id,
                "selection": selection,
            }),
            Self::OperationReceived { operation } => json!({ "operation": operation }),
            Self::Metrics { metrics } => serde_json::to_value(metrics).unwrap_or(Value::Null),
            Self::Pong => json!({}),
            Self::Error { error } => json!({ "error": error }),
        }
    }

    /// Peer attributed on the envelope, when the event has one.
    fn envelope_user(&self) -> Option<&str> {
        match self {
            Self::UserJoined { user } => Some(&user.id),
            Self::UserLeft { user_id }
            | Self::CursorChanged { user_id, .. }
            | Self::SelectionChanged { user_id, .. } => Some(user_id),
            Self::OperationReceived { operation } => Some(&operation.user_id),
            _ => None,
        }
    }

    /// Serialize into the wire envelope.
    pub fn to_frame(&self) -> String {
        let mut envelope = json!({
            "type": self.type_tag(),
            "data": self.data(),
            "timestamp": Utc::now(),
        });
        if let Some(user) = self.envelope_user() {
            envelope["userId"] = json!(user);
        }
        envelope.to_string()
    }
}

/// Error reply for a failed frame; the connection stays open.
pub fn error_frame(message: &str) -> String {
    ServerEvent::Error {
        error: message.to_string(),
    }
    .to_frame()
}
