//! Operational transform over element paths.
//!
//! `transform(op, against, priority)` rewrites `op` so that it can be applied
//! on top of `against`, where both were produced from the same tree state.
//! `priority` tells which of the two commits first:
//!
//! ```text
//!            S
//!          /   \
//!         a     b            a, b concurrent at the same base
//!          \   /
//!  S·a·transform(b, a, Earlier) == S·b·transform(a, b, Later)
//! ```
//!
//! The sequencer always transforms incoming edits against already committed
//! ones (`Earlier`). A replica transforms a committed edit against its own
//! unacknowledged edits (`Later`), because those will commit after it.
//!
//! Rules:
//! - structural edits ahead of a path in the same parent shift its index;
//! - an edit under a deleted subtree is dropped (`None`);
//! - paths under a moved node follow it to its destination;
//! - two writes to the same field of the same element: the later commit wins;
//!   writes to different fields never interact;
//! - two inserts at the same gap: the earlier commit stays first;
//! - a move back onto its own slot has no structural effect.

use crate::operation::{OpPayload, Operation};
use crate::path::ElementPath;

/// Commit order of `against` relative to the operation being transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Earlier,
    Later,
}

/// Rewrite `op` to apply after `against`. `None` means `op` no longer has a
/// target: its element was deleted, or a later write superseded it.
pub fn transform(op: &Operation, against: &Operation, priority: Priority) -> Option<Operation> {
    if against.is_noop_move() {
        return Some(op.clone());
    }
    let mut out = op.clone();

    match &op.payload {
        OpPayload::Insert { .. } => {
            out.element_path = remap(&op.element_path, against, true, priority)?;
        }

        OpPayload::Move { .. } if op.is_noop_move() => {
            let at = remap(&op.element_path, against, false, priority)?;
            out.payload = OpPayload::Move { to: at.clone() };
            out.element_path = at;
        }

        OpPayload::Move { to } => {
            if let OpPayload::Move { to: their_to } = &against.payload {
                if against.element_path == op.element_path {
                    // Same node moved twice: the later move wins and starts
                    // from wherever the earlier one left the node.
                    return match priority {
                        Priority::Earlier => {
                            out.element_path = their_to.clone();
                            Some(out)
                        }
                        Priority::Later => None,
                    };
                }
            }

            let from = remap(&op.element_path, against, false, priority)?;
            // `to` is addressed with the node detached; lift it into the
            // attached tree, remap it there, then detach the remapped source.
            let attached = shift_for_insert(to, &op.element_path, true, false)?;
            let attached = remap(&attached, against, true, priority)?;
            let to = shift_for_delete(&attached, &from, true)?;

            out.element_path = from;
            out.payload = OpPayload::Move { to };
        }

        OpPayload::Delete | OpPayload::SetField { .. } | OpPayload::SetText { .. } => {
            if priority == Priority::Later && writes_same_field(op, against) {
                return None;
            }
            out.element_path = remap(&op.element_path, against, false, priority)?;
        }
    }

    Some(out)
}

/// Transform `op` against a committed sequence, in commit order.
pub fn transform_all<'a>(
    op: &Operation,
    committed: impl IntoIterator<Item = &'a Operation>,
) -> Option<Operation> {
    committed
        .into_iter()
        .try_fold(op.clone(), |op, against| transform(&op, against, Priority::Earlier))
}

fn writes_same_field(op: &Operation, against: &Operation) -> bool {
    match (op.payload.written_field(), against.payload.written_field()) {
        (Some(mine), Some(theirs)) => mine == theirs && op.element_path == against.element_path,
        _ => false,
    }
}

/// Remap one path through the structural effect of `against`.
fn remap(
    path: &ElementPath,
    against: &Operation,
    gap: bool,
    priority: Priority,
) -> Option<ElementPath> {
    let at = &against.element_path;
    if at.is_root() {
        return Some(path.clone());
    }

    match &against.payload {
        OpPayload::Insert { .. } => shift_for_insert(path, at, gap, priority == Priority::Earlier),
        OpPayload::Delete => shift_for_delete(path, at, gap),
        OpPayload::Move { to } => {
            let gap_beside_source = gap && path.len() == at.len();
            if path.starts_with(at) && !gap_beside_source {
                return Some(path.rebase(at.len(), to));
            }
            let path = shift_for_delete(path, at, gap)?;
            shift_for_insert(&path, to, gap, priority == Priority::Earlier)
        }
        OpPayload::SetField { .. } | OpPayload::SetText { .. } => Some(path.clone()),
    }
}

/// Account for a node inserted at gap `at`.
///
/// A gap exactly at `at` only moves past the inserted node when `tie_shifts`.
/// `None` when the shifted index would not fit in a `usize`.
fn shift_for_insert(
    path: &ElementPath,
    at: &ElementPath,
    gap: bool,
    tie_shifts: bool,
) -> Option<ElementPath> {
    let Some(pivot) = at.last_index() else {
        return Some(path.clone());
    };
    let depth = at.len() - 1;
    if !path.shares_parent_at(at, depth) {
        return Some(path.clone());
    }

    let index = path.indices()[depth];
    let gap_at_level = gap && path.len() == at.len();
    let mut path = path.clone();
    if index > pivot || (index == pivot && (!gap_at_level || tie_shifts)) {
        *path.index_mut(depth) = index.checked_add(1)?;
    }
    Some(path)
}

/// Account for the subtree at `at` being removed.
fn shift_for_delete(path: &ElementPath, at: &ElementPath, gap: bool) -> Option<ElementPath> {
    let Some(pivot) = at.last_index() else {
        return Some(path.clone());
    };
    let depth = at.len() - 1;
    if !path.shares_parent_at(at, depth) {
        return Some(path.clone());
    }

    let index = path.indices()[depth];
    let mut path = path.clone();
    if index == pivot {
        // The slot itself survives; anything addressed through it does not.
        return (gap && path.len() == at.len()).then_some(path);
    }
    if index > pivot {
        *path.index_mut(depth) -= 1;
    }
    Some(path)
}
