//! Rollback path
//!
//! Rollback runs once every disk worker has stopped. It is best-effort across
//! disks: one disk failing to roll back does not stop the others. Disks past
//! the merge point are finished forward instead, since their snapshot was
//! already folded back into the source.

use super::CloneTransaction;
use hotclone_core::{CloneError, CloneState, DiskId, DiskState, SnapshotHandle, SnapshotName};
use tracing::{debug, error, info, warn};

impl CloneTransaction<'_> {
    /// Roll the transaction back after `cause` and return the final error
    ///
    /// Returns `RolledBack` when no disk committed, `PartialFailure` when
    /// some did, `RollbackIncomplete` when a rollback step itself failed
    /// (the record stays `Failing` for recovery), or `Log`.
    pub(super) fn fail(&self, cause: CloneError) -> CloneError {
        warn!(target: "hotclone::txn", txn_id = %self.txn_id, cause = %cause, "Rolling back transaction");

        let cause_text = cause.to_string();
        if let Err(e) = self.persist(|r| {
            if r.failure.is_none() {
                r.failure = Some(cause_text);
            }
            if r.state != CloneState::Failing {
                r.set_state(CloneState::Failing)?;
            }
            Ok(())
        }) {
            return e;
        }

        let disks: Vec<(DiskId, DiskState)> = {
            let record = self.record.lock();
            record
                .disks
                .iter()
                .map(|(id, d)| (id.clone(), d.state))
                .collect()
        };

        let mut first_error = None;
        for (disk, state) in disks {
            let result = match state {
                DiskState::Committed | DiskState::Discarded => continue,
                DiskState::Merging => self.finish_merge(&disk),
                _ => self.discard_disk(&disk, state),
            };
            match result {
                Ok(()) => {}
                Err(e @ CloneError::Log(_)) => {
                    error!(target: "hotclone::txn", txn_id = %self.txn_id, error = %e, "Transaction log failed during rollback");
                    return e;
                }
                Err(e) => {
                    warn!(target: "hotclone::txn", txn_id = %self.txn_id, disk = %disk, error = %e, "Rollback step failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            error!(
                target: "hotclone::txn",
                txn_id = %self.txn_id,
                error = %e,
                "Rollback incomplete; record left in Failing for recovery"
            );
            return CloneError::RollbackIncomplete {
                txn_id: self.txn_id,
                cause: Box::new(e),
            };
        }

        let (committed, discarded) = {
            let record = self.record.lock();
            let discarded: Vec<DiskId> = record
                .disks
                .iter()
                .filter(|(_, d)| d.state == DiskState::Discarded)
                .map(|(id, _)| id.clone())
                .collect();
            (record.committed_disks(), discarded)
        };

        if committed.is_empty() {
            if let Err(e) = self.persist(|r| r.set_state(CloneState::RolledBack)) {
                return e;
            }
            info!(target: "hotclone::txn", txn_id = %self.txn_id, "Transaction rolled back");
            return CloneError::RolledBack {
                txn_id: self.txn_id,
                cause: Box::new(cause),
            };
        }

        if let Err(e) = self.persist(|r| r.set_state(CloneState::PartialFailure)) {
            return e;
        }
        error!(
            target: "hotclone::txn",
            txn_id = %self.txn_id,
            committed = ?committed,
            failed = ?discarded,
            "Transaction partially failed; committed copies are kept"
        );
        CloneError::PartialFailure {
            txn_id: self.txn_id,
            committed,
            failed: discarded,
            cause: Box::new(cause),
        }
    }

    fn finish_merge(&self, disk: &DiskId) -> Result<(), CloneError> {
        if let Some(handle) = self.disk(disk)?.snapshot {
            self.release_snapshot(disk, &handle)?;
        }
        self.persist(|r| r.advance_disk(disk, DiskState::Committed).map(|_| ()))?;
        info!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, "Disk past merge point committed during rollback");
        Ok(())
    }

    /// Release the disk's snapshot and remove its partial copy
    fn discard_disk(&self, disk: &DiskId, state: DiskState) -> Result<(), CloneError> {
        let record = self.disk(disk)?;
        let handle = match record.snapshot {
            Some(handle) => Some(handle),
            None if state == DiskState::SnapshotCreating => self.find_orphan_snapshot(disk)?,
            None => None,
        };

        if let Some(handle) = &handle {
            self.release_snapshot(disk, handle)?;
        }
        if matches!(state, DiskState::Copying | DiskState::Copied) {
            self.ctx
                .copier
                .discard(&record.dest_path)
                .map_err(|e| CloneError::copy(disk, e))?;
        }

        self.persist(|r| r.advance_disk(disk, DiskState::Discarded).map(|_| ()))?;
        debug!(
            target: "hotclone::disk",
            txn_id = %self.txn_id,
            disk = %disk,
            released_snapshot = handle.is_some(),
            "Disk discarded"
        );
        Ok(())
    }

    /// Look up a snapshot created under this disk's name but never recorded
    ///
    /// A crash or error between the hypervisor call and the persist of
    /// `SnapshotActive` leaves the snapshot reachable only by name.
    fn find_orphan_snapshot(&self, disk: &DiskId) -> Result<Option<SnapshotHandle>, CloneError> {
        let expected = SnapshotName::for_disk(self.txn_id, disk);
        match self.ctx.hypervisor.list_snapshots(&self.source_vm()) {
            Ok(listed) => Ok(listed.into_iter().find(|h| h.name == expected)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(CloneError::hypervisor(disk, e)),
        }
    }
}
