//! Messages of the session service.
//!
//! Revisions are assigned deterministically from the revision a mutation
//! assumed: a `Set` on a key that never existed creates revision 0, every
//! other `Set` or `Remove` yields `old_revision + 1`. Both peers can therefore
//! compute the outcome of an accepted request on their own.

use serde::{Deserialize, Serialize};
use tandem_wire::SerializedPayload;

/// One mutation, or read precondition, of a context key.
///
/// `old_revision` is the revision the mutator last saw for the key, tombstones
/// included; `None` means the key never existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemUpdate {
    /// The key was read and must still be at this revision.
    Required { old_revision: Option<u64> },
    Set {
        old_revision: Option<u64>,
        value: SerializedPayload,
    },
    Remove { old_revision: Option<u64> },
}

impl ItemUpdate {
    pub fn old_revision(&self) -> Option<u64> {
        match self {
            ItemUpdate::Required { old_revision }
            | ItemUpdate::Set { old_revision, .. }
            | ItemUpdate::Remove { old_revision } => *old_revision,
        }
    }

    /// Revision the key has once this update is applied.
    pub fn new_revision(&self) -> Option<u64> {
        match self {
            ItemUpdate::Required { old_revision } => *old_revision,
            ItemUpdate::Set { old_revision, .. } | ItemUpdate::Remove { old_revision } => {
                Some(next_revision(*old_revision))
            }
        }
    }
}

pub(crate) fn next_revision(old: Option<u64>) -> u64 {
    old.map_or(0, |revision| revision + 1)
}

/// A batch of updates, accepted or rejected as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdateRequest {
    pub updates: Vec<(String, ItemUpdate)>,
}

impl ContextUpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Whether the batch changes anything, as opposed to only checking reads.
    pub fn has_mutations(&self) -> bool {
        self.updates
            .iter()
            .any(|(_, update)| !matches!(update, ItemUpdate::Required { .. }))
    }
}

/// Authoritative state of a key whose assumed revision was stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Updated {
        revision: u64,
        value: SerializedPayload,
    },
    /// The key was removed at `revision`, or never existed when `None`.
    Removed { revision: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextUpdateResult {
    Accepted,
    Rejected { reasons: Vec<(String, RejectReason)> },
}

impl ContextUpdateResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ContextUpdateResult::Accepted)
    }
}
