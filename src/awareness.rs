//! Presence registry for real-time cursor & selection awareness.
//!
//! Per-document soft state: who is connected, where their cursor sits,
//! what they have selected, and when they were last heard from. Awareness
//! is broadcast but never part of the convergent document state.
//!
//! Every mutation yields an [`AwarenessDiff`] that the session coordinator
//! translates into broadcast events.
//!
//! ```text
//! cursor_update ──► clamp into [0, len] ──► diff { updated: [entry] }
//! selection_update ─► normalize + clamp ──► diff { updated: [entry] }
//! silence > stale ──► online = false    ──► diff { updated: [entry] }
//! silence > evict ──► entry dropped     ──► diff { removed: [peer] }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fallback palette for cursor colors, assigned by hashing the peer id.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9", "#F8B500", "#00CED1",
];

/// Cursor soft state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub pos: u32,
    pub ts: DateTime<Utc>,
}

/// Selection soft state; `start <= end` always holds after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub start: u32,
    pub end: u32,
    pub ts: DateTime<Utc>,
}

/// One peer's presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub peer: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionState>,
    pub online: bool,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

/// What changed in one registry mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessDiff {
    pub added: Vec<AwarenessEntry>,
    pub updated: Vec<AwarenessEntry>,
    pub removed: Vec<String>,
}

impl AwarenessDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Per-document presence map. Writes are restricted to the owning
/// session coordinator.
#[derive(Debug, Clone)]
pub struct AwarenessRegistry {
    entries: HashMap<String, AwarenessEntry>,
    palette: Vec<String>,
}

impl AwarenessRegistry {
    pub fn new(palette: Vec<String>) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.iter().map(|s| s.to_string()).collect()
        } else {
            palette
        };
        Self {
            entries: HashMap::new(),
            palette,
        }
    }

    /// Stable color for a peer: FNV-1a over the id, folded into the palette.
    pub fn color_for(&self, peer: &str) -> &str {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in peer.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        &self.palette[(hash as usize) % self.palette.len()]
    }

    /// Register a peer (or bring an offline entry back online).
    pub fn join(&mut self, peer: &str, display_name: &str, now: DateTime<Utc>) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        match self.entries.get_mut(peer) {
            Some(entry) => {
                entry.online = true;
                entry.display_name = display_name.to_string();
                entry.last_seen = now;
                diff.updated.push(entry.clone());
            }
            None => {
                let entry = AwarenessEntry {
                    peer: peer.to_string(),
                    display_name: display_name.to_string(),
                    color: self.color_for(peer).to_string(),
                    cursor: None,
                    selection: None,
                    online: true,
                    last_seen: now,
                };
                self.entries.insert(peer.to_string(), entry.clone());
                diff.added.push(entry);
            }
        }
        diff
    }

    /// Mark a peer offline (kept for the evict window).
    pub fn mark_offline(&mut self, peer: &str, now: DateTime<Utc>) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.online = false;
            entry.last_seen = now;
            diff.updated.push(entry.clone());
        }
        diff
    }

    /// Drop a peer entirely.
    pub fn remove(&mut self, peer: &str) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        if self.entries.remove(peer).is_some() {
            diff.removed.push(peer.to_string());
        }
        diff
    }

    /// Record a cursor position, clamped into `[0, text_len]`.
    pub fn update_cursor(
        &mut self,
        peer: &str,
        pos: u32,
        text_len: u32,
        now: DateTime<Utc>,
    ) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.cursor = Some(CursorState {
                pos: pos.min(text_len),
                ts: now,
            });
            entry.last_seen = now;
            diff.updated.push(entry.clone());
        }
        diff
    }

    /// Record a selection, normalized so `start <= end` and clamped.
    pub fn update_selection(
        &mut self,
        peer: &str,
        start: u32,
        end: u32,
        text_len: u32,
        now: DateTime<Utc>,
    ) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        if let Some(entry) = self.entries.get_mut(peer) {
            let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
            entry.selection = Some(SelectionState {
                start: lo.min(text_len),
                end: hi.min(text_len),
                ts: now,
            });
            entry.last_seen = now;
            diff.updated.push(entry.clone());
        }
        diff
    }

    /// Refresh a peer's last-seen timestamp without other changes.
    pub fn touch(&mut self, peer: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.last_seen = now;
        }
    }

    /// Timeout pass: peers silent past `stale_ms` go offline; peers silent
    /// past `stale_ms + evict_ms` are removed.
    pub fn sweep(&mut self, now: DateTime<Utc>, stale_ms: u64, evict_ms: u64) -> AwarenessDiff {
        let mut diff = AwarenessDiff::default();
        let mut evicted = Vec::new();
        for entry in self.entries.values_mut() {
            let silent = (now - entry.last_seen).num_milliseconds().max(0) as u64;
            if silent >= stale_ms + evict_ms {
                evicted.push(entry.peer.clone());
            } else if entry.online && silent >= stale_ms {
                entry.online = false;
                diff.updated.push(entry.clone());
            }
        }
        for peer in evicted {
            self.entries.remove(&peer);
            diff.removed.push(peer);
        }
        diff
    }

    /// All entries, ordered by peer id for deterministic wire output.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        let mut out: Vec<AwarenessEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    pub fn get(&self, peer: &str) -> Option<&AwarenessEntry> {
        self.entries.get(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Online peer count.
    pub fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.online).count()
    }
}

impl Default for AwarenessRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
