//! Undo validation over a merge operation chain.
//!
//! A merge mutates its kept page in place, so merges on one page stack:
//! only the most recent still-completed merge on a page may be undone.

use serde::Serialize;

use crate::error::DedupeError;
use crate::models::{MergeOperation, MergeStatus};

/// Outcome of validating an undo.
#[derive(Debug, Clone, Serialize)]
pub struct UndoCheck {
    pub can_undo: bool,
    pub requires_sequential_undo: bool,
    /// Later completed merges on the same target, ascending by timestamp.
    pub required_undos: Vec<MergeOperation>,
    /// The most recent blocking merge; undo this one first.
    pub next_required_undo: Option<MergeOperation>,
    pub reason: Option<String>,
}

impl UndoCheck {
    fn permitted() -> Self {
        Self {
            can_undo: true,
            requires_sequential_undo: false,
            required_undos: Vec::new(),
            next_required_undo: None,
            reason: None,
        }
    }

    /// Convert a refusal into [`DedupeError::SequentialUndoRequired`].
    pub fn into_result(self) -> Result<(), DedupeError> {
        match self.next_required_undo {
            Some(blocking) if !self.can_undo => Err(DedupeError::SequentialUndoRequired {
                blocking: Box::new(blocking),
            }),
            _ => Ok(()),
        }
    }
}

/// Validate undoing `op` given the chain for its target page.
///
/// `op` must be `completed`; anything else fails closed with
/// `InvalidState`. The chain may include `op` itself and operations in any
/// status. Blocking operations are the *other* completed operations with a
/// strictly greater timestamp.
pub fn check_undo(op: &MergeOperation, chain: &[MergeOperation]) -> Result<UndoCheck, DedupeError> {
    if op.status != MergeStatus::Completed {
        return Err(DedupeError::InvalidState(format!(
            "merge {} is {}, only completed merges can be undone",
            op.id, op.status
        )));
    }

    let mut blocking: Vec<MergeOperation> = chain
        .iter()
        .filter(|other| other.id != op.id)
        .filter(|other| other.status == MergeStatus::Completed)
        .filter(|other| other.timestamp > op.timestamp)
        .cloned()
        .collect();

    if blocking.is_empty() {
        return Ok(UndoCheck::permitted());
    }

    blocking.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let next = blocking.last().cloned();
    let reason = format!(
        "{} later merge(s) on this page must be undone first; next: {}",
        blocking.len(),
        next.as_ref().map(|n| n.id.as_str()).unwrap_or_default()
    );

    Ok(UndoCheck {
        can_undo: false,
        requires_sequential_undo: true,
        required_undos: blocking,
        next_required_undo: next,
        reason: Some(reason),
    })
}
