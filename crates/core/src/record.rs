//! Durable transaction records
//!
//! A [`TransactionRecord`] is the unit persisted by the transaction log. Each
//! state transition is written before the action it authorizes is relied
//! upon, so replaying the log after a crash always finds a record consistent
//! with what happened on the hypervisor.

use crate::error::CloneError;
use crate::state::{CloneState, DiskState};
use crate::timestamp::Timestamp;
use crate::types::{CloneRequest, DiskId, SnapshotHandle, TxnId, VmId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Per-disk progress inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    /// Image backing the disk when the transaction was admitted
    pub source_path: PathBuf,
    /// Where the copy is written
    pub dest_path: PathBuf,
    /// Current per-disk state
    pub state: DiskState,
    /// Snapshot handle, recorded once the hypervisor confirmed it
    #[serde(default)]
    pub snapshot: Option<SnapshotHandle>,
    /// Bytes copied as of the last progress checkpoint
    #[serde(default)]
    pub bytes_copied: u64,
    /// Total bytes to copy, once known
    #[serde(default)]
    pub total_bytes: Option<u64>,
    /// How many times the copy was started (restarts after a crash count)
    #[serde(default)]
    pub copy_attempts: u32,
}

impl DiskRecord {
    /// Fresh record for a disk that has not been touched yet
    pub fn new(source_path: impl Into<PathBuf>, dest_path: impl Into<PathBuf>) -> Self {
        DiskRecord {
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            state: DiskState::Pending,
            snapshot: None,
            bytes_copied: 0,
            total_bytes: None,
            copy_attempts: 0,
        }
    }
}

/// Durable state of one clone transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction identifier (log key)
    pub txn_id: TxnId,
    /// The admitted request
    pub request: CloneRequest,
    /// Current transaction state
    pub state: CloneState,
    /// Per-disk records, keyed by disk id
    pub disks: BTreeMap<DiskId, DiskRecord>,
    /// When the record was created
    pub created_at: Timestamp,
    /// When the record was last persisted
    pub last_updated: Timestamp,
    /// First failure that drove the transaction to `Failing`
    #[serde(default)]
    pub failure: Option<String>,
    /// Registered destination VM, once `DefineVM` succeeded
    #[serde(default)]
    pub destination_vm: Option<VmId>,
}

impl TransactionRecord {
    /// Create a `Pending` record
    pub fn new(txn_id: TxnId, request: CloneRequest, disks: BTreeMap<DiskId, DiskRecord>) -> Self {
        let now = Timestamp::now();
        TransactionRecord {
            txn_id,
            request,
            state: CloneState::Pending,
            disks,
            created_at: now,
            last_updated: now,
            failure: None,
            destination_vm: None,
        }
    }

    /// Source VM of the request
    pub fn source_vm(&self) -> &VmId {
        &self.request.source
    }

    /// Is the record in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transaction phase implied by the disks (least advanced disk wins)
    pub fn derived_state(&self) -> CloneState {
        self.disks
            .values()
            .map(|d| d.state.phase())
            .min_by_key(|s| phase_rank(*s))
            .unwrap_or(CloneState::Pending)
    }

    /// Move the transaction state to match its disks while running
    ///
    /// No-op once the transaction is failing or terminal.
    pub fn refresh_state(&mut self) {
        if self.state == CloneState::Failing || self.state.is_terminal() {
            return;
        }
        let derived = self.derived_state();
        if self.state.can_transition_to(derived) {
            self.state = derived;
        }
    }

    /// Explicit transaction transition
    ///
    /// # Errors
    /// `CloneError::InvalidTransition` if the state machine forbids it.
    pub fn set_state(&mut self, next: CloneState) -> Result<(), CloneError> {
        if !self.state.can_transition_to(next) {
            return Err(CloneError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Advance one disk and return it for further updates
    ///
    /// # Errors
    /// `CloneError::InvalidTransition` for an illegal per-disk move or an
    /// unknown disk.
    pub fn advance_disk(&mut self, disk: &DiskId, next: DiskState) -> Result<&mut DiskRecord, CloneError> {
        let record = self.disks.get_mut(disk).ok_or_else(|| CloneError::InvalidTransition {
            from: format!("unknown disk {}", disk),
            to: next.to_string(),
        })?;
        if !record.state.can_advance_to(next) {
            return Err(CloneError::InvalidTransition {
                from: format!("{}:{}", disk, record.state),
                to: next.to_string(),
            });
        }
        record.state = next;
        Ok(record)
    }

    /// Update the last-persisted timestamp
    pub fn touch(&mut self) {
        self.last_updated = Timestamp::now();
    }

    /// Disks whose merge has been authorized or completed
    pub fn disks_past_merge_point(&self) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|(_, d)| d.state.is_past_merge_point())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Disks that are fully committed
    pub fn committed_disks(&self) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|(_, d)| d.state == DiskState::Committed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every disk is committed
    pub fn all_disks_committed(&self) -> bool {
        !self.disks.is_empty() && self.disks.values().all(|d| d.state == DiskState::Committed)
    }

    /// Destination paths in disk order, used to register the destination VM
    pub fn destination_paths(&self) -> BTreeMap<DiskId, PathBuf> {
        self.disks
            .iter()
            .map(|(id, d)| (id.clone(), d.dest_path.clone()))
            .collect()
    }
}

fn phase_rank(state: CloneState) -> u8 {
    match state {
        CloneState::Pending => 0,
        CloneState::SnapshotCreating => 1,
        CloneState::SnapshotActive => 2,
        CloneState::Copying => 3,
        CloneState::Merging => 4,
        _ => 5,
    }
}
