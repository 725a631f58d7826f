//! Clone transaction state machine
//!
//! A [`CloneTransaction`] drives one [`TransactionRecord`] to a terminal
//! state. Every state transition is persisted to the transaction log before
//! the action it authorizes is relied upon:
//!
//! 1. persist `SnapshotCreating`, then create the snapshot under its
//!    deterministic name (the name, not a prior persist, is the recovery
//!    anchor for this one call)
//! 2. persist `SnapshotActive` together with the snapshot handle
//! 3. persist `Copying`, copy the frozen base image, checkpointing progress
//! 4. persist `Copied`, then `Merging` (the merge point), merge and delete
//!    the snapshot, tolerating "not found" on replay
//! 5. persist `Committed` per disk; once every disk is committed the
//!    destination VM is registered and the transaction is `Committed`
//!
//! Disks run concurrently on a bounded pool of scoped threads. The first
//! failure stops the siblings at their next step boundary and the
//! transaction rolls back. A failed log write is treated like a crash: the
//! transaction stops acting and leaves the record for recovery.

mod disk;
mod rollback;
mod workers;

use crate::config::ProgressConfig;
use crate::recovery::{RecoveryAction, RecoveryPlan};
use hotclone_concurrency::CancellationToken;
use hotclone_core::{
    BlockCopier, CloneError, CloneState, DiskId, DiskRecord, DiskState, HypervisorClient,
    HypervisorError, SnapshotHandle, TransactionRecord, TxnId, VmId,
};
use hotclone_durability::TransactionLog;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Collaborators and tunables a transaction runs with
#[derive(Clone, Copy)]
pub struct TxnContext<'a> {
    /// Snapshot lifecycle and VM registration
    pub hypervisor: &'a dyn HypervisorClient,
    /// Bulk copy of base images
    pub copier: &'a dyn BlockCopier,
    /// Durable record store
    pub log: &'a dyn TransactionLog,
    /// Disks processed concurrently
    pub max_parallel_disks: usize,
    /// Copy-progress checkpointing
    pub progress: &'a ProgressConfig,
}

/// One clone transaction
pub struct CloneTransaction<'a> {
    ctx: TxnContext<'a>,
    txn_id: TxnId,
    record: Arc<Mutex<TransactionRecord>>,
    /// Caller-requested cancellation
    cancel: CancellationToken,
    /// Internal stop signal raised by the first failing disk
    abort: CancellationToken,
    /// First failure observed by any disk
    failure: Mutex<Option<CloneError>>,
}

impl<'a> CloneTransaction<'a> {
    /// Wrap a record; nothing is persisted until [`run`](Self::run)
    pub fn new(ctx: TxnContext<'a>, record: TransactionRecord, cancel: CancellationToken) -> Self {
        Self::with_shared(ctx, Arc::new(Mutex::new(record)), cancel)
    }

    /// Wrap a record that a handle observes concurrently
    pub fn with_shared(
        ctx: TxnContext<'a>,
        record: Arc<Mutex<TransactionRecord>>,
        cancel: CancellationToken,
    ) -> Self {
        let txn_id = record.lock().txn_id;
        CloneTransaction {
            ctx,
            txn_id,
            record,
            cancel,
            abort: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    /// Transaction id
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Copy of the in-memory record
    pub fn snapshot(&self) -> TransactionRecord {
        self.record.lock().clone()
    }

    /// Drive every disk forward from its persisted state
    ///
    /// Returns the committed record. Any other outcome is an error:
    /// `RolledBack`, `PartialFailure`, `RollbackIncomplete`, or `Log`.
    pub fn run(&self) -> Result<TransactionRecord, CloneError> {
        let disks: Vec<DiskId> = {
            let record = self.record.lock();
            record
                .disks
                .iter()
                .filter(|(_, d)| d.state != DiskState::Committed)
                .map(|(id, _)| id.clone())
                .collect()
        };

        workers::for_each_disk(&disks, self.ctx.max_parallel_disks, |disk| {
            if let Err(e) = self.drive_disk(disk) {
                self.note_failure(disk, e);
            }
        });

        let failure = self.failure.lock().take();
        if let Some(cause) = failure {
            return self.settle_failure(cause);
        }

        match self.register_destination() {
            Ok(()) => Ok(self.snapshot()),
            Err(e) => self.settle_failure(e),
        }
    }

    /// Continue a recovered transaction according to its recovery plan
    pub fn resume(&self, plan: RecoveryPlan) -> Result<TransactionRecord, CloneError> {
        match plan.action {
            RecoveryAction::Ambiguous { reason } => Err(self.mark_ambiguous(reason)),
            RecoveryAction::Forward => {
                self.adopt(plan.adopted)?;
                info!(target: "hotclone::recovery", txn_id = %self.txn_id, "Resuming transaction forward");
                self.run()
            }
            RecoveryAction::Rollback { cause } => {
                self.adopt(plan.adopted)?;
                info!(target: "hotclone::recovery", txn_id = %self.txn_id, cause = %cause, "Rolling back recovered transaction");
                self.settle_failure(CloneError::Interrupted(cause))
            }
        }
    }

    fn settle_failure(&self, cause: CloneError) -> Result<TransactionRecord, CloneError> {
        if matches!(cause, CloneError::Log(_)) {
            error!(
                target: "hotclone::txn",
                txn_id = %self.txn_id,
                error = %cause,
                "Transaction log failed; stopping without rollback"
            );
            return Err(cause);
        }
        Err(self.fail(cause))
    }

    /// Record snapshots found by recovery for disks that crashed mid-create
    fn adopt(&self, adopted: Vec<(DiskId, SnapshotHandle)>) -> Result<(), CloneError> {
        for (disk, handle) in adopted {
            info!(
                target: "hotclone::recovery",
                txn_id = %self.txn_id,
                disk = %disk,
                snapshot = %handle.name,
                "Adopting snapshot created before the crash"
            );
            self.persist(|r| {
                let d = r.advance_disk(&disk, DiskState::SnapshotActive)?;
                d.snapshot = Some(handle);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn mark_ambiguous(&self, reason: String) -> CloneError {
        let persisted = self.persist(|r| {
            r.failure = Some(reason.clone());
            r.set_state(CloneState::Ambiguous)
        });
        if let Err(e) = persisted {
            return e;
        }
        error!(
            target: "hotclone::recovery",
            txn_id = %self.txn_id,
            reason = %reason,
            "Transaction is ambiguous; operator attention required"
        );
        CloneError::RecoveryAmbiguous {
            txn_id: self.txn_id,
            reason,
        }
    }

    /// Register the destination VM once every disk is committed
    ///
    /// A crash between the last disk commit and this step is resumed here:
    /// an already registered destination is accepted as ours only when its
    /// disks are exactly this transaction's copies.
    fn register_destination(&self) -> Result<(), CloneError> {
        let (source, name, disks) = {
            let record = self.record.lock();
            (
                record.request.source.clone(),
                record.request.destination.clone(),
                record.destination_paths(),
            )
        };
        let vm_level = DiskId::from("*");

        let existing = self
            .ctx
            .hypervisor
            .describe_vm(&VmId::new(name.clone()))
            .map_err(|e| CloneError::hypervisor(&vm_level, e))?;
        let vm = match existing {
            Some(info) => {
                let registered: BTreeSet<PathBuf> = self
                    .ctx
                    .hypervisor
                    .get_disk_paths(&info.id)
                    .map_err(|e| CloneError::hypervisor(&vm_level, e))?
                    .into_values()
                    .map(|d| d.path)
                    .collect();
                let ours: BTreeSet<PathBuf> = disks.values().cloned().collect();
                if registered != ours {
                    return Err(CloneError::hypervisor(
                        &vm_level,
                        HypervisorError::Failed(format!(
                            "destination VM {} exists but is not backed by this transaction's copies",
                            info.id
                        )),
                    ));
                }
                info!(target: "hotclone::txn", txn_id = %self.txn_id, vm = %info.id, "Destination VM already registered");
                info.id
            }
            None => self
                .ctx
                .hypervisor
                .define_vm(&source, &name, &disks)
                .map_err(|e| CloneError::hypervisor(&vm_level, e))?,
        };

        self.persist(|r| {
            r.destination_vm = Some(vm.clone());
            r.set_state(CloneState::Committed)
        })?;
        info!(
            target: "hotclone::txn",
            txn_id = %self.txn_id,
            source = %source,
            destination = %vm,
            disks = disks.len(),
            "Transaction committed"
        );
        Ok(())
    }

    /// Apply `update`, refresh the derived state, and write the record
    ///
    /// The record lock is held across the log write so persists of sibling
    /// disks are serialized and each write carries every earlier update.
    fn persist<R>(
        &self,
        update: impl FnOnce(&mut TransactionRecord) -> Result<R, CloneError>,
    ) -> Result<R, CloneError> {
        let mut record = self.record.lock();
        let before = record.state;
        let out = update(&mut record)?;
        record.refresh_state();
        record.touch();

        if let Err(e) = self.ctx.log.put(&record) {
            self.abort.cancel();
            return Err(e.into());
        }
        if record.state != before {
            debug!(
                target: "hotclone::txn",
                txn_id = %self.txn_id,
                from = %before,
                to = %record.state,
                "Transaction state persisted"
            );
        }
        Ok(out)
    }

    /// Remember the first failure and stop the sibling disks
    ///
    /// A disk that stopped only because a sibling failed reports
    /// `Cancelled` without a caller cancellation; that is not a cause.
    /// Log failures take precedence over every other cause.
    fn note_failure(&self, disk: &DiskId, err: CloneError) {
        if matches!(err, CloneError::Cancelled) && !self.cancel.is_cancelled() {
            debug!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, "Disk stopped after sibling failure");
            return;
        }
        warn!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, error = %err, "Disk step failed");

        let mut slot = self.failure.lock();
        let replace = match &*slot {
            None => true,
            Some(CloneError::Log(_)) => false,
            Some(_) => matches!(err, CloneError::Log(_)),
        };
        if replace {
            *slot = Some(err);
        }
        drop(slot);
        self.abort.cancel();
    }

    fn check_abort(&self) -> Result<(), CloneError> {
        if self.cancel.is_cancelled() || self.abort.is_cancelled() {
            Err(CloneError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn disk(&self, disk: &DiskId) -> Result<DiskRecord, CloneError> {
        self.record
            .lock()
            .disks
            .get(disk)
            .cloned()
            .ok_or_else(|| CloneError::InvalidTransition {
                from: format!("unknown disk {}", disk),
                to: "any".to_string(),
            })
    }

    fn source_vm(&self) -> VmId {
        self.record.lock().request.source.clone()
    }

    /// Merge then delete a snapshot, each tolerating "not found"
    ///
    /// Used on the success path and by rollback alike: the guest-visible
    /// state of the source disk is preserved either way.
    fn release_snapshot(&self, disk: &DiskId, handle: &SnapshotHandle) -> Result<(), CloneError> {
        match self.ctx.hypervisor.merge_snapshot(handle) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, snapshot = %handle.name, "Snapshot already merged");
            }
            Err(e) => return Err(CloneError::hypervisor(disk, e)),
        }
        match self.ctx.hypervisor.delete_snapshot(handle) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(target: "hotclone::disk", txn_id = %self.txn_id, disk = %disk, snapshot = %handle.name, "Snapshot already deleted");
            }
            Err(e) => return Err(CloneError::hypervisor(disk, e)),
        }
        Ok(())
    }
}
