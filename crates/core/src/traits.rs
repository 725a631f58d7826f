//! Collaborator interfaces
//!
//! The transaction manager orchestrates two external collaborators:
//!
//! - [`HypervisorClient`]: snapshot lifecycle, disk topology, VM registration
//! - [`BlockCopier`]: bulk copy of a frozen base image
//!
//! Both are blocking from the caller's perspective. Each transaction runs on
//! its own thread, so the state machine stays linear.

use crate::error::{CopyError, HypervisorError};
use crate::types::{DiskId, DiskInfo, SnapshotHandle, TxnId, VmId, VmInfo};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Hypervisor operations consumed by clone transactions
pub trait HypervisorClient: Send + Sync {
    /// Describe a VM, `None` if it does not exist
    fn describe_vm(&self, vm: &VmId) -> Result<Option<VmInfo>, HypervisorError>;

    /// Disk topology of a VM keyed by disk id
    fn get_disk_paths(&self, vm: &VmId) -> Result<BTreeMap<DiskId, DiskInfo>, HypervisorError>;

    /// Create an external snapshot of one disk under a deterministic name
    ///
    /// Guest writes land in the snapshot's overlay afterwards; the returned
    /// handle's `base_path` is frozen.
    fn create_snapshot(
        &self,
        txn_id: TxnId,
        vm: &VmId,
        disk: &DiskId,
        name: &str,
    ) -> Result<SnapshotHandle, HypervisorError>;

    /// Commit the snapshot's overlay back into the live disk chain
    ///
    /// Returns `NotFound` if the snapshot is already gone.
    fn merge_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError>;

    /// Remove a merged snapshot
    ///
    /// Returns `NotFound` if the snapshot is already gone.
    fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError>;

    /// Snapshots on `vm` that follow the deterministic naming convention
    fn list_snapshots(&self, vm: &VmId) -> Result<Vec<SnapshotHandle>, HypervisorError>;

    /// Register a new VM modelled on `template`, backed by `disks`
    fn define_vm(
        &self,
        template: &VmId,
        name: &str,
        disks: &BTreeMap<DiskId, PathBuf>,
    ) -> Result<VmId, HypervisorError>;
}

/// Cooperative abort signal checked between copy chunks
pub trait AbortSignal: Send + Sync {
    /// True once the copy should stop
    fn is_aborted(&self) -> bool;
}

/// Abort signal that never fires
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_aborted(&self) -> bool {
        false
    }
}

/// Progress report emitted by a copier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    /// Bytes of the source processed so far
    pub bytes_copied: u64,
    /// Total size of the source
    pub total_bytes: u64,
}

/// Bulk copy of a disk image
pub trait BlockCopier: Send + Sync {
    /// Copy `source` to `dest`, returning the number of bytes processed
    ///
    /// `dest` is created or truncated. `abort` is checked between chunks;
    /// when it fires the copy stops with `CopyError::Cancelled`.
    fn copy(
        &self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
        abort: &dyn AbortSignal,
    ) -> Result<u64, CopyError>;

    /// Remove a (possibly partial) destination artifact
    ///
    /// Succeeds if `dest` does not exist.
    fn discard(&self, dest: &Path) -> Result<(), CopyError>;
}
