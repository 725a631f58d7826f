//! Startup recovery planning
//!
//! After a crash the transaction log holds every non-terminal record as it
//! was last persisted. Before any of them is driven again, its per-disk
//! states are reconciled against the snapshots the hypervisor still lists
//! under this transaction's deterministic names:
//!
//! | record says | hypervisor lists | decision |
//! |---|---|---|
//! | `SnapshotCreating` | snapshot | adopt it (the create landed) |
//! | `SnapshotCreating` | nothing | create it again |
//! | `Pending` | snapshot | ambiguous |
//! | `SnapshotActive`/`Copying`/`Copied` | nothing | ambiguous unless rolling back |
//! | `Committed`/`Discarded` | snapshot | ambiguous |
//! | snapshot for an unknown disk | | ambiguous |
//!
//! A record in `Failing` finishes its rollback. A record with any disk past
//! the merge point resumes forward, since its merges cannot be undone.
//! Anything else follows the configured [`RecoveryPolicy`].

use crate::config::RecoveryPolicy;
use hotclone_core::{
    CloneError, CloneState, DiskId, DiskState, SnapshotHandle, SnapshotName, TransactionRecord,
    TxnId,
};
use std::collections::BTreeMap;

/// What recovery does with one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drive the remaining disks forward
    Forward,
    /// Roll back everything not past the merge point
    Rollback {
        /// Why the transaction is rolled back
        cause: String,
    },
    /// Log and hypervisor disagree; mark the record for an operator
    Ambiguous {
        /// What could not be reconciled
        reason: String,
    },
}

/// Recovery decision for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// What to do
    pub action: RecoveryAction,
    /// Orphan snapshots to record before acting, one per `SnapshotCreating` disk
    pub adopted: Vec<(DiskId, SnapshotHandle)>,
}

impl RecoveryPlan {
    fn ambiguous(reason: String) -> Self {
        RecoveryPlan {
            action: RecoveryAction::Ambiguous { reason },
            adopted: Vec::new(),
        }
    }
}

/// Decide how to recover `record` given the hypervisor's snapshot listing
///
/// `listed` may contain snapshots of other transactions and foreign
/// snapshots; only names attributed to this record's transaction count.
pub fn plan_recovery(
    record: &TransactionRecord,
    listed: &[SnapshotHandle],
    policy: RecoveryPolicy,
) -> RecoveryPlan {
    let mut ours: BTreeMap<DiskId, &SnapshotHandle> = BTreeMap::new();
    for handle in listed {
        if let Some((txn_id, disk)) = SnapshotName::parse(&handle.name) {
            if txn_id == record.txn_id {
                ours.insert(disk, handle);
            }
        }
    }

    for disk in ours.keys() {
        if !record.disks.contains_key(disk) {
            return RecoveryPlan::ambiguous(format!(
                "hypervisor lists a snapshot for disk {} which the transaction does not cover",
                disk
            ));
        }
    }

    let rolling_back = record.state == CloneState::Failing;
    let mut adopted = Vec::new();

    for (disk, d) in &record.disks {
        let found = ours.get(disk);
        match (d.state, found) {
            (DiskState::Pending, Some(_)) => {
                return RecoveryPlan::ambiguous(format!(
                    "disk {} was never snapshotted but a snapshot exists",
                    disk
                ));
            }
            (DiskState::SnapshotCreating, Some(handle)) => {
                adopted.push((disk.clone(), (*handle).clone()));
            }
            (state, None) if state.holds_snapshot() && !rolling_back => {
                return RecoveryPlan::ambiguous(format!(
                    "disk {} is recorded as {} but its snapshot is gone",
                    disk, state
                ));
            }
            (DiskState::Committed | DiskState::Discarded, Some(_)) => {
                return RecoveryPlan::ambiguous(format!(
                    "disk {} is recorded as {} but its snapshot still exists",
                    disk, d.state
                ));
            }
            _ => {}
        }
    }

    let action = if rolling_back {
        RecoveryAction::Rollback {
            cause: record
                .failure
                .clone()
                .unwrap_or_else(|| "interrupted during rollback".to_string()),
        }
    } else if !record.disks_past_merge_point().is_empty() {
        RecoveryAction::Forward
    } else {
        match policy {
            RecoveryPolicy::Resume => RecoveryAction::Forward,
            RecoveryPolicy::Rollback => RecoveryAction::Rollback {
                cause: "process restarted before the merge point".to_string(),
            },
        }
    };

    RecoveryPlan { action, adopted }
}

/// Outcome of recovering one record
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Recovered transaction
    pub txn_id: TxnId,
    /// State the record ended in
    pub state: CloneState,
    /// Error the transaction ended with, `None` if it committed
    pub error: Option<CloneError>,
}

/// Summary of a startup recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// One entry per non-terminal record found at startup, oldest first
    pub outcomes: Vec<RecoveryOutcome>,
}

impl RecoveryReport {
    /// Number of recovered records
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True if nothing needed recovery
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of records that ended in `state`
    pub fn count(&self, state: CloneState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// True if any record needs an operator
    pub fn needs_operator(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.error.as_ref().is_some_and(CloneError::needs_operator))
    }

    /// Most severe exit code across the pass
    ///
    /// A clean rollback is the expected outcome of recovering a crashed
    /// transaction and does not fail the pass.
    pub fn exit_code(&self) -> i32 {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_ref())
            .filter(|e| !matches!(e, CloneError::RolledBack { .. }))
            .map(CloneError::exit_code)
            .max()
            .unwrap_or(0)
    }
}
