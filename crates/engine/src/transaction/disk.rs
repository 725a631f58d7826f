//! Per-disk forward path

use super::CloneTransaction;
use crate::progress::ProgressCheckpointer;
use hotclone_concurrency::EitherToken;
use hotclone_core::{CloneError, CopyError, DiskId, DiskState, SnapshotName};
use tracing::{debug, info};

impl CloneTransaction<'_> {
    /// Advance one disk from its persisted state to `Committed`
    ///
    /// Each iteration performs exactly one step, so a disk recovered in any
    /// state re-enters the loop at the right place. The abort signal is
    /// checked at every step boundary before the merge point; once a disk
    /// is `Merging` it is always finished.
    pub(super) fn drive_disk(&self, disk: &DiskId) -> Result<(), CloneError> {
        loop {
            let state = self.disk(disk)?.state;
            match state {
                DiskState::Pending => {
                    self.check_abort()?;
                    self.persist(|r| r.advance_disk(disk, DiskState::SnapshotCreating).map(|_| ()))?;
                }
                DiskState::SnapshotCreating => self.create_snapshot(disk)?,
                DiskState::SnapshotActive | DiskState::Copying => {
                    self.check_abort()?;
                    self.start_copy(disk, state)?;
                    self.copy_disk(disk)?;
                }
                DiskState::Copied => {
                    self.check_abort()?;
                    self.persist(|r| r.advance_disk(disk, DiskState::Merging).map(|_| ()))?;
                    debug!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, "Merge point crossed");
                }
                DiskState::Merging => {
                    let handle = self.disk(disk)?.snapshot.ok_or_else(|| {
                        CloneError::InvalidTransition {
                            from: format!("{}:Merging without a snapshot handle", disk),
                            to: DiskState::Committed.to_string(),
                        }
                    })?;
                    self.release_snapshot(disk, &handle)?;
                    self.persist(|r| r.advance_disk(disk, DiskState::Committed).map(|_| ()))?;
                    info!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, "Disk committed");
                }
                DiskState::Committed => return Ok(()),
                DiskState::Discarded => {
                    return Err(CloneError::InvalidTransition {
                        from: format!("{}:{}", disk, state),
                        to: DiskState::Committed.to_string(),
                    })
                }
            }
        }
    }

    fn create_snapshot(&self, disk: &DiskId) -> Result<(), CloneError> {
        self.check_abort()?;
        let vm = self.source_vm();
        let name = SnapshotName::for_disk(self.txn_id, disk);
        debug!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, snapshot = %name, "Creating snapshot");

        let handle = self
            .ctx
            .hypervisor
            .create_snapshot(self.txn_id, &vm, disk, &name)
            .map_err(|e| CloneError::hypervisor(disk, e))?;
        let base = handle.base_path.clone();

        self.persist(|r| {
            let d = r.advance_disk(disk, DiskState::SnapshotActive)?;
            d.snapshot = Some(handle);
            Ok(())
        })?;
        info!(
            target: "hotclone::disk",
            txn_id = %self.txn_id,
            disk = %disk,
            snapshot = %name,
            base = %base.display(),
            "Snapshot active"
        );
        Ok(())
    }

    /// Persist the start of a copy attempt
    ///
    /// A disk found in `Copying` was interrupted mid-copy. Partial output
    /// cannot be trusted, so it is discarded and the copy restarts from zero.
    fn start_copy(&self, disk: &DiskId, from: DiskState) -> Result<(), CloneError> {
        if from == DiskState::Copying {
            let record = self.disk(disk)?;
            info!(
                target: "hotclone::disk",
                txn_id = %self.txn_id,
                disk = %disk,
                attempt = record.copy_attempts + 1,
                checkpointed_bytes = record.bytes_copied,
                "Restarting interrupted copy from zero"
            );
            self.ctx
                .copier
                .discard(&record.dest_path)
                .map_err(|e| CloneError::copy(disk, e))?;
        }
        self.persist(|r| {
            let d = r.advance_disk(disk, DiskState::Copying)?;
            d.copy_attempts += 1;
            d.bytes_copied = 0;
            d.total_bytes = None;
            Ok(())
        })
    }

    fn copy_disk(&self, disk: &DiskId) -> Result<(), CloneError> {
        let record = self.disk(disk)?;
        let base = record
            .snapshot
            .as_ref()
            .map(|h| h.base_path.clone())
            .ok_or_else(|| CloneError::InvalidTransition {
                from: format!("{}:Copying without a snapshot handle", disk),
                to: DiskState::Copied.to_string(),
            })?;

        let mut checkpointer = ProgressCheckpointer::new(self.ctx.progress);
        let mut progress_error = None;
        let signal = EitherToken::new(&self.cancel, &self.abort);

        let result = self.ctx.copier.copy(
            &base,
            &record.dest_path,
            &mut |p| {
                if progress_error.is_some() || !checkpointer.should_checkpoint(p.bytes_copied) {
                    return;
                }
                let persisted = self.persist(|r| {
                    if let Some(d) = r.disks.get_mut(disk) {
                        d.bytes_copied = p.bytes_copied;
                        d.total_bytes = Some(p.total_bytes);
                    }
                    Ok(())
                });
                match persisted {
                    Ok(()) => checkpointer.mark(p.bytes_copied),
                    // persist already raised the abort signal
                    Err(e) => progress_error = Some(e),
                }
            },
            &signal,
        );

        if let Some(e) = progress_error {
            return Err(e);
        }
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(CopyError::Cancelled) => return Err(CloneError::Cancelled),
            Err(e) => return Err(CloneError::copy(disk, e)),
        };

        self.persist(|r| {
            let d = r.advance_disk(disk, DiskState::Copied)?;
            d.bytes_copied = bytes;
            d.total_bytes = Some(bytes);
            Ok(())
        })?;
        info!(
            target: "hotclone::disk",
            txn_id = %self.txn_id,
            disk = %disk,
            bytes,
            dest = %record.dest_path.display(),
            "Copy complete"
        );
        Ok(())
    }
}
