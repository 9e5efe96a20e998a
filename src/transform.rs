//! Operational transformation for position rebasing.
//!
//! Rewrites an operation's positional parameters so that its effect on a
//! rebased state equals its intent against the original state. Used for
//! cursor-relative edits and for peers that composed an operation against
//! a slightly stale view; the replicated text in [`crate::crdt`] remains
//! the authoritative merge.
//!
//! The transform is pure and total, and satisfies TP1 for insert/insert
//! pairs. TP2 is not required: concurrent deletes are resolved by
//! character-identity tombstoning in the replicated text.

use crate::crdt::{OpKind, Operation};

/// Rebase `op` against a single concurrent operation `against`.
pub fn transform(op: &Operation, against: &Operation) -> Operation {
    let mut out = op.clone();
    let p = i64::from(op.position);
    let q = i64::from(against.position);

    match (op.kind, against.kind) {
        (OpKind::Insert, OpKind::Insert) => {
            let shift = i64::from(against.insert_len());
            // Tie on position: smaller (site, lamport) stays left.
            if q < p || (q == p && (against.site, against.lamport) < (op.site, op.lamport)) {
                out.position = (p + shift) as u32;
            }
        }
        (OpKind::Insert, OpKind::Delete) => {
            if q < p {
                let l = i64::from(against.delete_len());
                out.position = (p - l.min(p - q)) as u32;
            }
        }
        (OpKind::Delete, OpKind::Insert) => {
            let len = i64::from(op.delete_len());
            let shift = i64::from(against.insert_len());
            if q <= p {
                out.position = (p + shift) as u32;
            } else if q < p + len {
                // The insert landed inside the deleted range; widen so the
                // delete still covers its original characters.
                out.length = Some((len + shift) as u32);
            }
        }
        (OpKind::Delete, OpKind::Delete) => {
            let len = i64::from(op.delete_len());
            let other = i64::from(against.delete_len());
            let overlap = (p + len).min(q + other) - p.max(q);
            if overlap > 0 {
                out.length = Some((len - overlap) as u32);
            }
            if q < p {
                let before = p.min(q + other) - q;
                out.position = (p - before) as u32;
            }
        }
        // Retain has no positional effect in either direction.
        (OpKind::Retain, _) | (_, OpKind::Retain) => {}
    }
    out
}

/// Rebase `op` against a set of concurrent operations, left to right.
pub fn transform_all(op: &Operation, concurrent: &[Operation]) -> Operation {
    concurrent
        .iter()
        .fold(op.clone(), |acc, against| transform(&acc, against))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::SiteId;

    fn ins(pos: u32, text: &str, site: u64, lamport: u64) -> Operation {
        Operation::insert(pos, text, SiteId(site), lamport)
    }

    fn del(pos: u32, len: u32, site: u64, lamport: u64) -> Operation {
        Operation::delete(pos, len, SiteId(site), lamport)
    }

    // ── Insert vs Insert ─────────────────────────────────────────

    #[test]
    fn test_insert_shifted_by_earlier_insert() {
        let op = ins(5, "ab", 2, 1);
        let against = ins(3, "xyz", 1, 1);
        assert_eq!(transform(&op, &against).position, 8);
    }

    #[test]
    fn test_insert_unaffected_by_later_insert() {
        let op = ins(2, "ab", 2, 1);
        let against = ins(5, "xyz", 1, 1);
        assert_eq!(transform(&op, &against).position, 2);
    }

    #[test]
    fn test_insert_tie_smaller_site_stays_left() {
        let a = ins(4, "a", 1, 1);
        let b = ins(4, "b", 2, 1);
        // b rebased against a: a is smaller, stays left, b shifts.
        assert_eq!(transform(&b, &a).position, 5);
        // a rebased against b: a is still smaller, keeps its spot.
        assert_eq!(transform(&a, &b).position, 4);
    }

    #[test]
    fn test_insert_insert_tp1() {
        // transform(transform(op,a),b) == transform(transform(op,b),a)
        let cases = [
            (ins(4, "q", 3, 2), ins(1, "aa", 1, 1), ins(4, "b", 2, 1)),
            (ins(0, "q", 3, 2), ins(0, "a", 1, 1), ins(0, "bb", 2, 1)),
            (ins(7, "qq", 1, 5), ins(7, "a", 2, 5), ins(7, "b", 3, 5)),
        ];
        for (op, a, b) in cases {
            let ab = transform(&transform(&op, &a), &b);
            let ba = transform(&transform(&op, &b), &a);
            assert_eq!(ab.position, ba.position, "TP1 violated for {op:?}");
        }
    }

    // ── Insert vs Delete ─────────────────────────────────────────

    #[test]
    fn test_insert_shifted_left_by_delete_before() {
        let op = ins(6, "x", 2, 1);
        assert_eq!(transform(&op, &del(2, 3, 1, 1)).position, 3);
    }

    #[test]
    fn test_insert_clamped_into_deleted_range() {
        let op = ins(4, "x", 2, 1);
        // Delete [2, 8) swallows position 4; the insert lands at the cut.
        assert_eq!(transform(&op, &del(2, 6, 1, 1)).position, 2);
    }

    #[test]
    fn test_insert_unaffected_by_delete_after() {
        let op = ins(1, "x", 2, 1);
        assert_eq!(transform(&op, &del(3, 2, 1, 1)).position, 1);
    }

    // ── Delete vs Insert ─────────────────────────────────────────

    #[test]
    fn test_delete_shifted_by_insert_before() {
        let op = del(4, 2, 2, 1);
        let t = transform(&op, &ins(1, "ab", 1, 1));
        assert_eq!(t.position, 6);
        assert_eq!(t.length, Some(2));
    }

    #[test]
    fn test_delete_widened_by_insert_inside() {
        let op = del(2, 3, 2, 1);
        let t = transform(&op, &ins(3, "ab", 1, 1));
        assert_eq!(t.position, 2);
        assert_eq!(t.length, Some(5));
    }

    #[test]
    fn test_delete_unaffected_by_insert_after() {
        let op = del(2, 3, 2, 1);
        let t = transform(&op, &ins(5, "ab", 1, 1));
        assert_eq!(t.position, 2);
        assert_eq!(t.length, Some(3));
    }

    // ── Delete vs Delete ─────────────────────────────────────────

    #[test]
    fn test_delete_shifted_by_disjoint_delete_before() {
        let op = del(6, 5, 2, 1);
        let t = transform(&op, &del(0, 6, 1, 1));
        assert_eq!(t.position, 0);
        assert_eq!(t.length, Some(5));
    }

    #[test]
    fn test_delete_shrunk_by_identical_delete() {
        let op = del(1, 1, 2, 1);
        let t = transform(&op, &del(1, 1, 1, 1));
        assert_eq!(t.position, 1);
        assert_eq!(t.length, Some(0));
    }

    #[test]
    fn test_delete_partial_overlap_from_left() {
        // op deletes [4, 9), against deletes [2, 6): overlap 2, before 2.
        let op = del(4, 5, 2, 1);
        let t = transform(&op, &del(2, 4, 1, 1));
        assert_eq!(t.position, 2);
        assert_eq!(t.length, Some(3));
    }

    #[test]
    fn test_delete_partial_overlap_from_right() {
        // op deletes [2, 6), against deletes [4, 9): overlap 2.
        let op = del(2, 4, 2, 1);
        let t = transform(&op, &del(4, 5, 1, 1));
        assert_eq!(t.position, 2);
        assert_eq!(t.length, Some(2));
    }

    #[test]
    fn test_delete_contained_in_other() {
        // op deletes [3, 5), against deletes [1, 8): fully swallowed.
        let op = del(3, 2, 2, 1);
        let t = transform(&op, &del(1, 7, 1, 1));
        assert_eq!(t.length, Some(0));
        assert_eq!(t.position, 1);
    }

    // ── Retain and folding ───────────────────────────────────────

    #[test]
    fn test_retain_is_inert() {
        let r = Operation::retain(3, SiteId(1), 1);
        let op = ins(5, "x", 2, 1);
        assert_eq!(transform(&op, &r).position, 5);
        assert_eq!(transform(&r, &op).position, 3);
    }

    #[test]
    fn test_transform_all_folds_in_order() {
        let op = ins(5, "x", 3, 1);
        let concurrent = vec![ins(0, "aa", 1, 1), del(1, 2, 2, 1)];
        // +2 from the leading insert, then -2 from the delete before it.
        assert_eq!(transform_all(&op, &concurrent).position, 5);
    }
}
