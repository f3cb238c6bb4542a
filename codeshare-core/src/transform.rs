//! Rebasing a batch over batches sequenced after the revision it was
//! written against.
//!
//! Offsets in a batch refer to the document its author saw. When other
//! batches have been sequenced since, every incoming operation is shifted
//! past each earlier change lying wholly before it, and an earlier change
//! lying wholly after it leaves it alone. Overlapping ranges still produce
//! an in-bounds result, but it depends on arrival order, so it is flagged
//! and left to checksum repair.

use crate::Operation;

/// Outcome of [`rebase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebased {
    /// The incoming operations, valid against the document after `prior`.
    pub operations: Vec<Operation>,
    /// The prior operations, valid against the document after `incoming`.
    pub carried: Vec<Operation>,
    /// Some incoming range overlapped a prior one.
    pub overlapped: bool,
}

fn inserted(op: &Operation) -> usize {
    op.len_delta().max(0) as usize
}

/// Rewrite `op` so it applies after `prior`, where both were written
/// against the same document.
///
/// `after_on_tie` places `op` behind `prior` when both insert at the same
/// offset. Returns the rewritten operation and whether the two ranges
/// overlapped.
pub fn transform(op: &Operation, prior: &Operation, after_on_tie: bool) -> (Operation, bool) {
    let at = op.position();
    let from = prior.position();

    match (op, prior) {
        (Operation::Insert { text, .. }, Operation::Insert { .. }) => {
            let shifted = if at > from || (at == from && after_on_tie) {
                at + inserted(prior)
            } else {
                at
            };
            // Same-offset inserts order by arrival, which is not symmetric.
            (Operation::insert(shifted, text.as_str()), at == from)
        }
        (Operation::Insert { text, .. }, Operation::Delete { length: removed, .. }) => {
            if at <= from {
                (op.clone(), false)
            } else if at >= from + removed {
                (Operation::insert(at - removed, text.as_str()), false)
            } else {
                // The anchor was deleted; land where the gap closed.
                (Operation::insert(from, text.as_str()), true)
            }
        }
        (Operation::Delete { length, .. }, Operation::Insert { .. }) => {
            if from <= at {
                (Operation::delete(at + inserted(prior), *length), false)
            } else if at + length <= from {
                (op.clone(), false)
            } else {
                // Text landed inside the range; it goes with it.
                (Operation::delete(at, length + inserted(prior)), true)
            }
        }
        (Operation::Delete { length, .. }, Operation::Delete { length: removed, .. }) => {
            let end = at + length;
            let prior_end = from + removed;
            if end <= from {
                (op.clone(), false)
            } else if at >= prior_end {
                (Operation::delete(at - removed, *length), false)
            } else {
                let before = from.saturating_sub(at);
                let after = end.saturating_sub(prior_end);
                (Operation::delete(at.min(from), before + after), true)
            }
        }
    }
}

/// Rewrite `incoming` so it applies after every operation in `prior`.
///
/// Both batches start from the same document. Each incoming operation is
/// carried across the prior ones, which are in turn carried across it so
/// the next incoming operation meets them in its own context. Operations
/// that become empty are dropped. `after_on_tie` orders same-offset
/// inserts as in [`transform`].
pub fn rebase(incoming: &[Operation], prior: &[Operation], after_on_tie: bool) -> Rebased {
    let mut carried = prior.to_vec();
    let mut operations = Vec::with_capacity(incoming.len());
    let mut overlapped = false;

    for op in incoming {
        let mut current = op.clone();
        for earlier in carried.iter_mut() {
            let (next, hit) = transform(&current, earlier, after_on_tie);
            let (moved, _) = transform(earlier, &current, !after_on_tie);
            overlapped |= hit;
            *earlier = moved;
            current = next;
        }
        if !current.is_noop() {
            operations.push(current);
        }
    }
    carried.retain(|op| !op.is_noop());

    Rebased {
        operations,
        carried,
        overlapped,
    }
}

/// [`rebase`] for a batch sequenced after `prior`: it goes second on ties.
pub fn transform_batch(incoming: &[Operation], prior: &[Operation]) -> Rebased {
    rebase(incoming, prior, true)
}
