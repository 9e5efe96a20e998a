//! Replicated text with conflict-free merge.
//!
//! Each character carries an immutable `(site, lamport, offset)` identity
//! assigned at insertion. Deletes tombstone cells instead of removing them,
//! so late-arriving concurrent operations keep their position semantics.
//! Remote operations are rebased against the concurrent suffix of the
//! operation log before integration; concurrent inserts at the same visible
//! position are ordered deterministically, so replicas that have applied the
//! same causal set of operations materialize identical text.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from replicated-text operations.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// Insert without content, or delete without a positive length.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// `restore` called on an instance that already holds state.
    #[error("restore requires a freshly constructed replica")]
    NotEmpty,
    /// Snapshot encode/decode failure.
    #[error("snapshot codec error: {0}")]
    Snapshot(String),
}

/// Per-replica identifier used for tie-breaking concurrent inserts.
///
/// Allocated by the session coordinator per connection; never reused
/// within a document session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SiteId(pub u64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site-{}", self.0)
    }
}

/// Operation kind carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Retain,
}

/// A single text operation.
///
/// `(site, lamport)` provides the total order used for tie-breaking;
/// `op_id` is globally unique and used for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: u32,
    pub content: Option<String>,
    pub length: Option<u32>,
    pub site: SiteId,
    pub lamport: u64,
    pub op_id: Uuid,
}

impl Operation {
    pub fn insert(position: u32, content: impl Into<String>, site: SiteId, lamport: u64) -> Self {
        Self {
            kind: OpKind::Insert,
            position,
            content: Some(content.into()),
            length: None,
            site,
            lamport,
            op_id: Uuid::new_v4(),
        }
    }

    pub fn delete(position: u32, length: u32, site: SiteId, lamport: u64) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            content: None,
            length: Some(length),
            site,
            lamport,
            op_id: Uuid::new_v4(),
        }
    }

    pub fn retain(position: u32, site: SiteId, lamport: u64) -> Self {
        Self {
            kind: OpKind::Retain,
            position,
            content: None,
            length: None,
            site,
            lamport,
            op_id: Uuid::new_v4(),
        }
    }

    /// Number of characters this operation inserts.
    pub fn insert_len(&self) -> u32 {
        match (self.kind, &self.content) {
            (OpKind::Insert, Some(s)) => s.chars().count() as u32,
            _ => 0,
        }
    }

    /// Number of characters this operation deletes.
    pub fn delete_len(&self) -> u32 {
        match self.kind {
            OpKind::Delete => self.length.unwrap_or(0),
            _ => 0,
        }
    }
}

/// Map from site to the highest lamport observed from that site.
///
/// Monotonic non-decreasing per site; used for duplicate detection and
/// serialized inside snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<SiteId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest lamport seen from `site` (0 when the site is unknown).
    pub fn get(&self, site: SiteId) -> u64 {
        self.0.get(&site).copied().unwrap_or(0)
    }

    /// Record `lamport` from `site`; never decreases.
    pub fn observe(&mut self, site: SiteId, lamport: u64) {
        let entry = self.0.entry(site).or_insert(0);
        if lamport > *entry {
            *entry = lamport;
        }
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.0.iter().all(|(site, l)| self.get(*site) >= *l)
    }

    /// Pointwise minimum of two clocks, over the union of their sites.
    pub fn min_with(&self, other: &VectorClock) -> VectorClock {
        let mut out = BTreeMap::new();
        for site in self.0.keys().chain(other.0.keys()) {
            out.insert(*site, self.get(*site).min(other.get(*site)));
        }
        VectorClock(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SiteId, u64)> + '_ {
        self.0.iter().map(|(s, l)| (*s, *l))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Immutable character identity: the stamp of the inserting operation
/// plus the character's offset inside that operation's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CharId {
    site: SiteId,
    lamport: u64,
    offset: u32,
}

/// The stamp of the operation that tombstoned a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DeleteStamp {
    site: SiteId,
    lamport: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CharCell {
    id: CharId,
    ch: char,
    deleted_by: Option<DeleteStamp>,
}

impl CharCell {
    fn visible(&self) -> bool {
        self.deleted_by.is_none()
    }
}

/// JSON sidecar written next to the opaque snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSidecar {
    #[serde(rename = "docId")]
    pub doc_id: String,
    pub vclock: VectorClock,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Everything the snapshot blob carries; self-sufficient for `restore`.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    site: SiteId,
    clock: u64,
    cells: Vec<CharCell>,
    vclock: VectorClock,
    seen: Vec<Uuid>,
    log: Vec<Operation>,
}

/// In-memory replicated text.
///
/// All replicas that have applied the same causal set of operations
/// (equal vector clocks) materialize the same `content()`.
#[derive(Debug, Clone)]
pub struct ReplicatedText {
    site: SiteId,
    /// Lamport clock: strictly above every lamport applied so far.
    clock: u64,
    cells: Vec<CharCell>,
    vclock: VectorClock,
    seen: HashSet<Uuid>,
    /// Causally ordered log, positions as applied (for late joiners).
    log: Vec<Operation>,
}

impl ReplicatedText {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: 0,
            cells: Vec::new(),
            vclock: VectorClock::new(),
            seen: HashSet::new(),
            log: Vec::new(),
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn vclock(&self) -> &VectorClock {
        &self.vclock
    }

    /// Causally ordered operation log (for late joiners).
    pub fn operations(&self) -> &[Operation] {
        &self.log
    }

    /// Advance the lamport clock to at least `lamport`. Used when adopting
    /// server state delivered as plain text instead of a snapshot blob, so
    /// locally generated operations sort after everything already applied.
    pub fn fast_forward(&mut self, lamport: u64) {
        self.clock = self.clock.max(lamport);
    }

    /// Visible character count.
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current materialization: visible cells in order.
    pub fn content(&self) -> String {
        self.cells
            .iter()
            .filter(|c| c.visible())
            .map(|c| c.ch)
            .collect()
    }

    // ───────────────────────────────────────────────────────────────
    // Local operations
    // ───────────────────────────────────────────────────────────────

    /// Generate, apply, and return a locally originated operation.
    ///
    /// Positions outside `[0, len]` are clamped silently.
    pub fn apply_local(
        &mut self,
        kind: OpKind,
        position: u32,
        content: Option<String>,
        length: Option<u32>,
    ) -> Result<Operation, CrdtError> {
        validate(kind, content.as_deref(), length)?;
        let lamport = self.clock + 1;
        let len = self.len() as u32;
        let pos = position.min(len);
        let op = Operation {
            kind,
            position: pos,
            content,
            length,
            site: self.site,
            lamport,
            op_id: Uuid::new_v4(),
        };
        match op.kind {
            OpKind::Insert => {
                let text = op.content.clone().unwrap_or_default();
                self.integrate_insert(pos, &text, op.site, op.lamport);
            }
            OpKind::Delete => {
                self.integrate_delete(pos, op.delete_len(), op.site, op.lamport);
            }
            OpKind::Retain => {}
        }
        self.record(&op);
        Ok(op)
    }

    /// Insert `text` at visible position `pos`.
    pub fn insert(&mut self, pos: u32, text: &str) -> Result<Operation, CrdtError> {
        self.apply_local(OpKind::Insert, pos, Some(text.to_string()), None)
    }

    /// Delete `length` characters starting at visible position `pos`.
    pub fn delete(&mut self, pos: u32, length: u32) -> Result<Operation, CrdtError> {
        self.apply_local(OpKind::Delete, pos, None, Some(length))
    }

    // ───────────────────────────────────────────────────────────────
    // Remote operations
    // ───────────────────────────────────────────────────────────────

    /// Merge an operation received from another replica.
    ///
    /// Idempotent: returns `Ok(false)` without touching state when the
    /// operation id has been seen or the site's clock already covers it.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.seen.contains(&op.op_id) || op.lamport <= self.vclock.get(op.site) {
            return Ok(false);
        }
        validate(op.kind, op.content.as_deref(), op.length)?;

        let mut applied = op.clone();
        applied.position = self.rebase(op);
        match applied.kind {
            OpKind::Insert => {
                let text = applied.content.clone().unwrap_or_default();
                let pos = applied.position.min(self.len() as u32);
                applied.position = pos;
                self.integrate_insert(pos, &text, applied.site, applied.lamport);
            }
            OpKind::Delete => {
                let pos = applied.position.min(self.len() as u32);
                applied.position = pos;
                self.integrate_delete(pos, applied.delete_len(), applied.site, applied.lamport);
            }
            OpKind::Retain => {}
        }
        self.record(&applied);
        Ok(true)
    }

    fn record(&mut self, op: &Operation) {
        self.clock = self.clock.max(op.lamport);
        self.vclock.observe(op.site, op.lamport);
        self.seen.insert(op.op_id);
        self.log.push(op.clone());
    }

    /// Adjust an incoming operation's position for logged operations it
    /// cannot have observed (other site, lamport not below its own).
    fn rebase(&self, op: &Operation) -> u32 {
        let mut pos = i64::from(op.position);
        for prior in &self.log {
            if prior.site == op.site || prior.lamport < op.lamport {
                continue;
            }
            let p = i64::from(prior.position);
            match prior.kind {
                OpKind::Insert => {
                    let l = i64::from(prior.insert_len());
                    if p < pos || (p == pos && stays_left(prior, op)) {
                        pos += l;
                    }
                }
                OpKind::Delete => {
                    if p < pos {
                        let l = i64::from(prior.delete_len());
                        pos -= l.min(pos - p);
                    }
                }
                OpKind::Retain => {}
            }
        }
        pos.max(0) as u32
    }

    /// Splice `text` in before the cell at visible position `pos`.
    fn integrate_insert(&mut self, pos: u32, text: &str, site: SiteId, lamport: u64) {
        let idx = self.cell_index_of_visible(pos);
        let cells = text.chars().enumerate().map(|(offset, ch)| CharCell {
            id: CharId {
                site,
                lamport,
                offset: offset as u32,
            },
            ch,
            deleted_by: None,
        });
        self.cells.splice(idx..idx, cells);
    }

    /// Tombstone up to `length` visible characters starting at visible
    /// position `pos`. Characters inserted concurrently with the delete
    /// (other site, lamport not below the delete's) are stepped over
    /// without being counted: the deleter never saw them.
    fn integrate_delete(&mut self, pos: u32, length: u32, site: SiteId, lamport: u64) {
        let mut idx = self.cell_index_of_visible(pos);
        let mut remaining = length;
        while remaining > 0 && idx < self.cells.len() {
            let cell = &mut self.cells[idx];
            if cell.visible() {
                let concurrent_insert = cell.id.site != site && cell.id.lamport >= lamport;
                if !concurrent_insert {
                    cell.deleted_by = Some(DeleteStamp { site, lamport });
                    remaining -= 1;
                }
            }
            idx += 1;
        }
    }

    /// Index of the cell holding the `pos`-th visible character, or the
    /// end of the cell vector when `pos >= len`.
    fn cell_index_of_visible(&self, pos: u32) -> usize {
        let mut seen = 0u32;
        for (idx, cell) in self.cells.iter().enumerate() {
            if cell.visible() {
                if seen == pos {
                    return idx;
                }
                seen += 1;
            }
        }
        self.cells.len()
    }

    // ───────────────────────────────────────────────────────────────
    // Snapshot / restore / garbage collection
    // ───────────────────────────────────────────────────────────────

    /// Opaque binary state blob; self-sufficient to `restore`.
    pub fn snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        let payload = SnapshotPayload {
            site: self.site,
            clock: self.clock,
            cells: self.cells.clone(),
            vclock: self.vclock.clone(),
            seen: self.seen.iter().copied().collect(),
            log: self.log.clone(),
        };
        bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| CrdtError::Snapshot(e.to_string()))
    }

    /// Load a snapshot into a freshly constructed replica.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), CrdtError> {
        if !self.cells.is_empty() || !self.log.is_empty() || self.clock != 0 {
            return Err(CrdtError::NotEmpty);
        }
        let (payload, _): (SnapshotPayload, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CrdtError::Snapshot(e.to_string()))?;
        self.clock = payload.clock;
        self.cells = payload.cells;
        self.vclock = payload.vclock;
        self.seen = payload.seen.into_iter().collect();
        self.log = payload.log;
        Ok(())
    }

    /// Sidecar metadata for the persistence layer.
    pub fn sidecar(&self, doc_id: impl Into<String>) -> SnapshotSidecar {
        SnapshotSidecar {
            doc_id: doc_id.into(),
            vclock: self.vclock.clone(),
            created_at: Utc::now(),
        }
    }

    /// Drop tombstones whose insertion and deletion are both covered by
    /// `min_clock` (the minimum vector clock across live peers). Once
    /// every peer has seen both stamps, no in-flight operation can still
    /// reference the tombstone.
    pub fn collect_garbage(&mut self, min_clock: &VectorClock) {
        self.cells.retain(|cell| match cell.deleted_by {
            None => true,
            Some(stamp) => {
                min_clock.get(cell.id.site) < cell.id.lamport
                    || min_clock.get(stamp.site) < stamp.lamport
            }
        });
    }

    /// Count of tombstoned cells still held internally.
    pub fn tombstone_count(&self) -> usize {
        self.cells.iter().filter(|c| !c.visible()).count()
    }
}

/// True when `prior` should stay to the left of `op` for concurrent
/// inserts at the same visible position: higher lamport first, smaller
/// site first among equals. Matches the face-value placement an
/// untransformed later insert would get, so both application orders agree.
fn stays_left(prior: &Operation, op: &Operation) -> bool {
    prior.lamport > op.lamport || (prior.lamport == op.lamport && prior.site < op.site)
}

fn validate(kind: OpKind, content: Option<&str>, length: Option<u32>) -> Result<(), CrdtError> {
    match kind {
        OpKind::Insert => match content {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(CrdtError::MalformedOperation(
                "insert requires non-empty content".into(),
            )),
        },
        OpKind::Delete => match length {
            Some(l) if l > 0 => Ok(()),
            _ => Err(CrdtError::MalformedOperation(
                "delete requires a positive length".into(),
            )),
        },
        OpKind::Retain => Ok(()),
    }
}

/// Seed a replica with initial content attributed to a reserved site 0.
///
/// Used by tests and by sessions restoring plain text without a snapshot.
pub fn seeded(site: SiteId, initial: &str) -> ReplicatedText {
    let mut rt = ReplicatedText::new(site);
    if !initial.is_empty() {
        let cells = initial.chars().enumerate().map(|(offset, ch)| CharCell {
            id: CharId {
                site: SiteId(0),
                lamport: 0,
                offset: offset as u32,
            },
            ch,
            deleted_by: None,
        });
        rt.cells.extend(cells);
    }
    rt
}
