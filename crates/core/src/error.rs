//! Error types for hot cloning
//!
//! [`CloneError`] is the taxonomy surfaced to callers. Collaborator failures
//! are reported through [`HypervisorError`] and [`CopyError`]; the transaction
//! catches them locally and turns them into a rollback.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{DiskId, TxnId, VmId};
use std::io;
use thiserror::Error;

/// Result type alias for hot-clone operations
pub type Result<T> = std::result::Result<T, CloneError>;

/// Failure reported by the hypervisor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HypervisorError {
    /// The object (VM, snapshot) does not exist
    ///
    /// Merge and delete replays treat this as success: the operation
    /// completed before a crash.
    #[error("not found: {0}")]
    NotFound(String),

    /// The hypervisor could not be reached
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),

    /// The call failed
    #[error("hypervisor call failed: {0}")]
    Failed(String),
}

impl HypervisorError {
    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }
}

/// Failure reported by the block copier
#[derive(Debug, Error)]
pub enum CopyError {
    /// I/O failure while reading the base image or writing the destination
    #[error("copy I/O error: {0}")]
    Io(#[from] io::Error),

    /// The abort signal was observed between chunks
    #[error("copy cancelled")]
    Cancelled,

    /// Any other copier failure
    #[error("copy failed: {0}")]
    Failed(String),
}

/// Error taxonomy for clone transactions
#[derive(Debug, Error)]
pub enum CloneError {
    /// Bad request; rejected before anything was persisted
    #[error("validation error: {0}")]
    Validation(String),

    /// A targeted disk already belongs to a live transaction
    #[error("disk {disk} of VM {vm} is locked by transaction {holder}")]
    Conflict {
        /// Source VM
        vm: VmId,
        /// Contended disk
        disk: DiskId,
        /// Transaction currently holding the disk
        holder: TxnId,
    },

    /// The destination VM name or a destination image is reserved by a
    /// live transaction
    #[error("{target} is reserved by transaction {holder}")]
    DestinationReserved {
        /// Reserved destination, e.g. `VM web-clone` or `image /var/x.img`
        target: String,
        /// Transaction holding the reservation
        holder: TxnId,
    },

    /// Snapshot/merge/delete/define call failed
    #[error("hypervisor error on disk {disk}: {source}")]
    Hypervisor {
        /// Disk the call was made for (VM-level calls use `*`)
        disk: DiskId,
        /// Underlying hypervisor failure
        #[source]
        source: HypervisorError,
    },

    /// Bulk copy failed
    #[error("copy error on disk {disk}: {source}")]
    Copy {
        /// Disk being copied
        disk: DiskId,
        /// Underlying copier failure
        #[source]
        source: CopyError,
    },

    /// The caller cancelled the transaction
    #[error("transaction cancelled")]
    Cancelled,

    /// The process stopped mid-transaction; recovery is rolling it back
    #[error("transaction interrupted: {0}")]
    Interrupted(String),

    /// The transaction failed and was cleanly rolled back
    #[error("transaction {txn_id} rolled back: {cause}")]
    RolledBack {
        /// Transaction id
        txn_id: TxnId,
        /// Failure that triggered the rollback
        cause: Box<CloneError>,
    },

    /// Some disks committed before a sibling failed; needs an operator
    #[error(
        "transaction {txn_id} partially failed: committed {committed:?}, failed {failed:?}: {cause}"
    )]
    PartialFailure {
        /// Transaction id
        txn_id: TxnId,
        /// Disks whose copy is final
        committed: Vec<DiskId>,
        /// Disks that were rolled back
        failed: Vec<DiskId>,
        /// Failure that triggered the partial rollback
        cause: Box<CloneError>,
    },

    /// Log state disagrees with the hypervisor; needs an operator
    #[error("transaction {txn_id} is ambiguous after recovery: {reason}")]
    RecoveryAmbiguous {
        /// Transaction id
        txn_id: TxnId,
        /// What could not be reconciled
        reason: String,
    },

    /// Rollback itself failed; the record stays in `Failing` for recovery
    #[error("rollback of transaction {txn_id} did not complete: {cause}")]
    RollbackIncomplete {
        /// Transaction id
        txn_id: TxnId,
        /// Failure during rollback
        cause: Box<CloneError>,
    },

    /// Forbidden state machine transition
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The transaction log failed; treated like a crash
    #[error("transaction log error: {0}")]
    Log(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl CloneError {
    /// Wrap a hypervisor failure for a disk
    pub fn hypervisor(disk: &DiskId, source: HypervisorError) -> Self {
        CloneError::Hypervisor {
            disk: disk.clone(),
            source,
        }
    }

    /// Wrap a copier failure for a disk
    pub fn copy(disk: &DiskId, source: CopyError) -> Self {
        CloneError::Copy {
            disk: disk.clone(),
            source,
        }
    }

    /// Errors that drive the state machine into rollback
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            CloneError::Hypervisor { .. }
                | CloneError::Copy { .. }
                | CloneError::Cancelled
                | CloneError::Interrupted(_)
        )
    }

    /// Outcomes that need operator attention rather than a retry
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            CloneError::PartialFailure { .. } | CloneError::RecoveryAmbiguous { .. }
        )
    }

    /// Process exit code for the command-line surface
    ///
    /// | code | meaning |
    /// |------|---------|
    /// | 1 | log, config, or internal failure |
    /// | 2 | validation |
    /// | 3 | conflict (disk locked or destination reserved) |
    /// | 4 | rolled back (clean failure) |
    /// | 5 | partial failure |
    /// | 6 | recovery ambiguous |
    /// | 7 | rollback incomplete |
    pub fn exit_code(&self) -> i32 {
        match self {
            CloneError::Validation(_) => 2,
            CloneError::Conflict { .. } | CloneError::DestinationReserved { .. } => 3,
            CloneError::RolledBack { .. } => 4,
            CloneError::PartialFailure { .. } => 5,
            CloneError::RecoveryAmbiguous { .. } => 6,
            CloneError::RollbackIncomplete { .. } => 7,
            _ => 1,
        }
    }
}
