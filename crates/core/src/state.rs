//! Transaction and per-disk state machines
//!
//! ## Transaction states
//!
//! ```text
//! Pending → SnapshotCreating → SnapshotActive → Copying → Merging → Committed
//!    │              │                 │            │          │
//!    └──────────────┴─────────────────┴────────────┴──────────┴──→ Failing → RolledBack
//!                                                                     │
//!                                                                     └──→ PartialFailure
//! ```
//!
//! `Ambiguous` is entered only by recovery, from any non-terminal state, when
//! the log cannot be reconciled with what the hypervisor reports.
//!
//! While disks are running the transaction state is derived from the disks
//! (the least advanced live disk wins); `Failing` and the terminal states are
//! set explicitly.

use serde::{Deserialize, Serialize};

/// State of a whole clone transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloneState {
    /// Record created, nothing done on the hypervisor yet
    Pending,
    /// Snapshot creation in flight for at least one disk
    SnapshotCreating,
    /// Every live disk holds a snapshot, copy not started everywhere
    SnapshotActive,
    /// Bulk copy in flight
    Copying,
    /// Snapshot merge/cleanup in flight
    Merging,
    /// Every disk committed and the destination VM registered
    Committed,
    /// Rollback in progress
    Failing,
    /// Rollback finished; source untouched, no destination registered
    RolledBack,
    /// At least one disk committed before a sibling failed
    PartialFailure,
    /// Log state could not be reconciled with the hypervisor
    Ambiguous,
}

impl CloneState {
    /// No further automatic transitions happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloneState::Committed
                | CloneState::RolledBack
                | CloneState::PartialFailure
                | CloneState::Ambiguous
        )
    }

    /// Terminal, and safe to garbage-collect after the retention window
    ///
    /// `PartialFailure` and `Ambiguous` need an operator and are kept.
    pub fn is_collectable(&self) -> bool {
        matches!(self, CloneState::Committed | CloneState::RolledBack)
    }

    /// The caller may request cancellation in this state
    pub fn is_cancellable(&self) -> bool {
        matches!(self, CloneState::SnapshotActive | CloneState::Copying)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: CloneState) -> bool {
        use CloneState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failing => *self != Failing,
            RolledBack | PartialFailure => *self == Failing,
            Ambiguous => true,
            Committed => *self == Merging,
            // forward progress along the success path, derived from disks
            _ => match (self.forward_rank(), next.forward_rank()) {
                (Some(from), Some(to)) => to >= from,
                _ => false,
            },
        }
    }

    fn forward_rank(&self) -> Option<u8> {
        match self {
            CloneState::Pending => Some(0),
            CloneState::SnapshotCreating => Some(1),
            CloneState::SnapshotActive => Some(2),
            CloneState::Copying => Some(3),
            CloneState::Merging => Some(4),
            CloneState::Committed => Some(5),
            _ => None,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneState::Pending => "Pending",
            CloneState::SnapshotCreating => "SnapshotCreating",
            CloneState::SnapshotActive => "SnapshotActive",
            CloneState::Copying => "Copying",
            CloneState::Merging => "Merging",
            CloneState::Committed => "Committed",
            CloneState::Failing => "Failing",
            CloneState::RolledBack => "RolledBack",
            CloneState::PartialFailure => "PartialFailure",
            CloneState::Ambiguous => "Ambiguous",
        }
    }
}

impl std::fmt::Display for CloneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of one disk inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiskState {
    /// Nothing done for this disk
    Pending,
    /// `CreateSnapshot` authorized; the hypervisor may or may not have it
    SnapshotCreating,
    /// Snapshot confirmed and its handle recorded
    SnapshotActive,
    /// Bulk copy authorized
    Copying,
    /// Bulk copy finished
    Copied,
    /// Merge/delete authorized
    Merging,
    /// Snapshot released, destination copy final
    Committed,
    /// Snapshot released and destination artifacts removed by rollback
    Discarded,
}

impl DiskState {
    /// The hypervisor is expected to hold this disk's snapshot
    pub fn holds_snapshot(&self) -> bool {
        matches!(
            self,
            DiskState::SnapshotActive | DiskState::Copying | DiskState::Copied
        )
    }

    /// The merge has been authorized; the disk can no longer be rolled back
    pub fn is_past_merge_point(&self) -> bool {
        matches!(self, DiskState::Merging | DiskState::Committed)
    }

    /// Per-disk forward transition check
    pub fn can_advance_to(&self, next: DiskState) -> bool {
        use DiskState::*;
        match (self, next) {
            (Committed, _) | (Discarded, _) => false,
            (_, Discarded) => !self.is_past_merge_point(),
            (Pending, SnapshotCreating)
            | (SnapshotCreating, SnapshotActive)
            | (SnapshotActive, Copying)
            | (Copying, Copying)
            | (Copying, Copied)
            | (Copied, Merging)
            | (Merging, Committed) => true,
            _ => false,
        }
    }

    /// Transaction-level phase this disk contributes while running
    pub fn phase(&self) -> CloneState {
        match self {
            DiskState::Pending => CloneState::Pending,
            DiskState::SnapshotCreating => CloneState::SnapshotCreating,
            DiskState::SnapshotActive => CloneState::SnapshotActive,
            DiskState::Copying | DiskState::Copied => CloneState::Copying,
            DiskState::Merging | DiskState::Committed | DiskState::Discarded => {
                CloneState::Merging
            }
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskState::Pending => "Pending",
            DiskState::SnapshotCreating => "SnapshotCreating",
            DiskState::SnapshotActive => "SnapshotActive",
            DiskState::Copying => "Copying",
            DiskState::Copied => "Copied",
            DiskState::Merging => "Merging",
            DiskState::Committed => "Committed",
            DiskState::Discarded => "Discarded",
        }
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
