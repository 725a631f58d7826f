//! Clone manager: admission, execution, and startup recovery
//!
//! The manager owns the collaborators, the transaction log, and the disk
//! lock registry. A request is validated and planned, its disks are locked,
//! and its `Pending` record is persisted before any hypervisor call is made.
//! Rejected requests (validation, conflict) leave nothing behind.
//!
//! Disk locks are held for the lifetime of a transaction. A transaction that
//! stopped without reaching a terminal state (failed log write, incomplete
//! rollback) keeps its locks until [`CloneManager::recover_on_startup`]
//! settles it.

use crate::config::HotcloneConfig;
use crate::plan::{plan_clone, ClonePlan};
use crate::recovery::{plan_recovery, RecoveryAction, RecoveryOutcome, RecoveryPlan, RecoveryReport};
use crate::transaction::{CloneTransaction, TxnContext};
use hotclone_concurrency::{CancellationToken, CloneClaim, DiskLockGuard, DiskLockRegistry};
use hotclone_core::{
    BlockCopier, CloneError, CloneRequest, CloneState, DiskId, HypervisorClient, Result,
    Timestamp, TransactionRecord, TxnId, VmId,
};
use hotclone_durability::{CorruptRecord, FileTransactionLog, LogError, TransactionLog};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Successful clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    /// Transaction that produced the clone
    pub txn_id: TxnId,
    /// Registered destination VM
    pub destination: VmId,
    /// Destination image per disk
    pub disks: BTreeMap<DiskId, PathBuf>,
    /// Bytes copied across all disks
    pub bytes_copied: u64,
}

impl CloneReport {
    fn from_record(record: &TransactionRecord) -> Self {
        CloneReport {
            txn_id: record.txn_id,
            destination: record
                .destination_vm
                .clone()
                .unwrap_or_else(|| VmId::new(record.request.destination.clone())),
            disks: record.destination_paths(),
            bytes_copied: record.disks.values().map(|d| d.bytes_copied).sum(),
        }
    }
}

struct Admitted {
    record: TransactionRecord,
    guard: DiskLockGuard,
}

/// Entry point for hot-clone transactions
pub struct CloneManager {
    hypervisor: Arc<dyn HypervisorClient>,
    copier: Arc<dyn BlockCopier>,
    log: Arc<dyn TransactionLog>,
    locks: Arc<DiskLockRegistry>,
    config: HotcloneConfig,
    /// Locks of transactions that stopped short of a terminal state
    stalled: Mutex<FxHashMap<TxnId, DiskLockGuard>>,
    _state_lock: Option<File>,
}

impl CloneManager {
    /// Manager over explicit collaborators
    ///
    /// # Errors
    ///
    /// `CloneError::Config` if the configuration is invalid.
    pub fn new(
        config: HotcloneConfig,
        hypervisor: Arc<dyn HypervisorClient>,
        copier: Arc<dyn BlockCopier>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(CloneManager {
            hypervisor,
            copier,
            log,
            locks: DiskLockRegistry::new(),
            config,
            stalled: Mutex::new(FxHashMap::default()),
            _state_lock: None,
        })
    }

    /// Manager over a file-backed log in `config.state_dir`
    ///
    /// Takes an exclusive lock on `<state_dir>/.lock`; a second process
    /// opening the same state directory is refused.
    ///
    /// # Errors
    ///
    /// `CloneError::Config` if the configuration is invalid or the state
    /// directory is locked by another process, `CloneError::Log` if the log
    /// cannot be opened.
    pub fn open(
        config: HotcloneConfig,
        hypervisor: Arc<dyn HypervisorClient>,
        copier: Arc<dyn BlockCopier>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = &config.state_dir;
        fs::create_dir_all(dir).map_err(|e| {
            CloneError::Config(format!("cannot create state directory {}: {}", dir.display(), e))
        })?;

        let lock_path = dir.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CloneError::Config(format!("cannot open {}: {}", lock_path.display(), e)))?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            CloneError::Config(format!(
                "state directory '{}' is already in use by another process",
                dir.display()
            ))
        })?;

        let log = FileTransactionLog::open(dir, config.durability)?;
        info!(
            target: "hotclone::txn",
            state_dir = %dir.display(),
            durability = config.durability.description(),
            "Clone manager opened"
        );

        let mut manager = Self::new(config, hypervisor, copier, Arc::new(log))?;
        manager._state_lock = Some(lock_file);
        Ok(manager)
    }

    /// Active configuration
    pub fn config(&self) -> &HotcloneConfig {
        &self.config
    }

    /// Disk lock registry shared by all transactions of this manager
    pub fn locks(&self) -> &Arc<DiskLockRegistry> {
        &self.locks
    }

    fn context(&self) -> TxnContext<'_> {
        TxnContext {
            hypervisor: &*self.hypervisor,
            copier: &*self.copier,
            log: &*self.log,
            max_parallel_disks: self.config.max_parallel_disks,
            progress: &self.config.progress,
        }
    }

    /// Validate and plan a request without side effects
    pub fn plan(&self, request: &CloneRequest) -> Result<ClonePlan> {
        plan_clone(&*self.hypervisor, &self.config, request)
    }

    fn admit(&self, request: &CloneRequest) -> Result<Admitted> {
        let plan = self.plan(request)?;
        let record = plan.into_record(TxnId::new());
        let txn_id = record.txn_id;
        let guard = self.lock_record(&record)?;
        self.log.put(&record)?;
        info!(
            target: "hotclone::txn",
            txn_id = %txn_id,
            source = %record.request.source,
            destination = %record.request.destination,
            disks = record.disks.len(),
            "Transaction admitted"
        );
        Ok(Admitted { record, guard })
    }

    /// Lock the source disks and reserve the destination of a record
    fn lock_record(&self, record: &TransactionRecord) -> Result<DiskLockGuard> {
        let disks: Vec<DiskId> = record.disks.keys().cloned().collect();
        let images: Vec<PathBuf> = record.disks.values().map(|d| d.dest_path.clone()).collect();
        let destination = VmId::new(record.request.destination.clone());
        self.locks.acquire_clone(
            record.txn_id,
            CloneClaim {
                vm: record.source_vm(),
                disks: &disks,
                destination: &destination,
                images: &images,
            },
        )
    }

    fn execute(
        &self,
        record: Arc<Mutex<TransactionRecord>>,
        guard: DiskLockGuard,
        cancel: CancellationToken,
    ) -> Result<CloneReport> {
        let txn = CloneTransaction::with_shared(self.context(), record, cancel);
        let result = txn.run();
        self.settle(guard, &result);
        result.map(|record| CloneReport::from_record(&record))
    }

    /// Keep the locks of a transaction that is not finished
    fn settle(&self, guard: DiskLockGuard, result: &Result<TransactionRecord>) {
        if let Err(e @ (CloneError::RollbackIncomplete { .. } | CloneError::Log(_))) = result {
            warn!(
                target: "hotclone::txn",
                txn_id = %guard.txn_id(),
                error = %e,
                "Transaction stalled; disks stay locked until recovery"
            );
            self.stalled.lock().insert(guard.txn_id(), guard);
        }
    }

    /// Clone a VM and wait for the outcome
    ///
    /// # Errors
    ///
    /// `Validation` and `Conflict` are returned before anything is
    /// persisted. Afterwards the transaction ends in `RolledBack`,
    /// `PartialFailure`, `RollbackIncomplete`, or `Log`.
    pub fn clone_vm(&self, request: &CloneRequest) -> Result<CloneReport> {
        let Admitted { record, guard } = self.admit(request)?;
        self.execute(Arc::new(Mutex::new(record)), guard, CancellationToken::new())
    }

    /// Admit a request and run it on its own thread
    ///
    /// Admission errors are returned synchronously.
    pub fn spawn(self: &Arc<Self>, request: &CloneRequest) -> Result<CloneHandle> {
        let Admitted { record, guard } = self.admit(request)?;
        let txn_id = record.txn_id;
        let shared = Arc::new(Mutex::new(record));
        let cancel = CancellationToken::new();
        // Handed to the worker once it runs; a failed spawn keeps it here.
        let guard_slot = Arc::new(Mutex::new(Some(guard)));

        let manager = Arc::clone(self);
        let worker_record = Arc::clone(&shared);
        let worker_cancel = cancel.clone();
        let worker_guard = Arc::clone(&guard_slot);
        let spawned = thread::Builder::new()
            .name(format!("hotclone-txn-{}", &txn_id.simple()[..8]))
            .spawn(move || {
                let guard = worker_guard.lock().take();
                match guard {
                    Some(guard) => manager.execute(worker_record, guard, worker_cancel),
                    None => Err(CloneError::Interrupted(
                        "transaction locks were released before the thread started".to_string(),
                    )),
                }
            });

        match spawned {
            Ok(join) => Ok(CloneHandle {
                txn_id,
                cancel,
                record: shared,
                join,
            }),
            Err(e) => {
                warn!(target: "hotclone::txn", txn_id = %txn_id, error = %e, "Failed to spawn transaction thread");
                let guard = guard_slot.lock().take();
                Err(self.abandon_unstarted(shared, guard, cancel, e.to_string()))
            }
        }
    }

    /// Roll back an admitted transaction that never started running
    ///
    /// The locks stay held until the rollback settled.
    fn abandon_unstarted(
        &self,
        record: Arc<Mutex<TransactionRecord>>,
        guard: Option<DiskLockGuard>,
        cancel: CancellationToken,
        reason: String,
    ) -> CloneError {
        let txn = CloneTransaction::with_shared(self.context(), record, cancel);
        let plan = RecoveryPlan {
            action: RecoveryAction::Rollback {
                cause: format!("failed to spawn transaction thread: {}", reason),
            },
            adopted: Vec::new(),
        };
        let result = txn.resume(plan);
        if let Some(guard) = guard {
            self.settle(guard, &result);
        }
        match result {
            Ok(_) => CloneError::Interrupted(reason),
            Err(err) => err,
        }
    }

    /// Settle every non-terminal transaction left by a previous process
    ///
    /// Each record is reconciled against the hypervisor's snapshot listing
    /// and then resumed forward or rolled back (see [`plan_recovery`]).
    /// Records of transactions still running in this process are skipped.
    ///
    /// # Errors
    ///
    /// Only a failure to read the log fails the pass; per-transaction
    /// failures are reported in the returned [`RecoveryReport`].
    pub fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let records = self.log.list_non_terminal()?;
        info!(target: "hotclone::recovery", count = records.len(), "Recovering incomplete transactions");

        let mut report = RecoveryReport::default();
        for record in records {
            let txn_id = record.txn_id;
            let stalled = self.stalled.lock().remove(&txn_id);
            let guard = match stalled {
                Some(guard) => guard,
                None if self.is_live(&record) => {
                    debug!(target: "hotclone::recovery", txn_id = %txn_id, "Transaction is running; skipped");
                    continue;
                }
                None => {
                    match self.lock_record(&record) {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(target: "hotclone::recovery", txn_id = %txn_id, error = %e, "Disks are locked; recovery skipped");
                            report.outcomes.push(RecoveryOutcome {
                                txn_id,
                                state: record.state,
                                error: Some(e),
                            });
                            continue;
                        }
                    }
                }
            };

            let listed = match self.hypervisor.list_snapshots(record.source_vm()) {
                Ok(listed) => listed,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => {
                    warn!(target: "hotclone::recovery", txn_id = %txn_id, error = %e, "Cannot list snapshots; recovery deferred");
                    report.outcomes.push(RecoveryOutcome {
                        txn_id,
                        state: record.state,
                        error: Some(CloneError::hypervisor(&DiskId::from("*"), e)),
                    });
                    continue;
                }
            };

            let plan = plan_recovery(&record, &listed, self.config.recovery);
            debug!(
                target: "hotclone::recovery",
                txn_id = %txn_id,
                state = %record.state,
                action = ?plan.action,
                adopted = plan.adopted.len(),
                "Recovery planned"
            );

            let txn = CloneTransaction::new(self.context(), record, CancellationToken::new());
            let result = txn.resume(plan);
            let state = txn.snapshot().state;
            self.settle(guard, &result);
            report.outcomes.push(RecoveryOutcome {
                txn_id,
                state,
                error: result.err(),
            });
        }

        // Unreadable records cannot be driven; an operator has to look at them
        for bad in self.log.corrupt()? {
            warn!(
                target: "hotclone::recovery",
                txn_id = %bad.txn_id,
                path = %bad.path.display(),
                "Record is unreadable; left for an operator"
            );
            report.outcomes.push(RecoveryOutcome {
                txn_id: bad.txn_id,
                state: CloneState::Ambiguous,
                error: Some(CloneError::RecoveryAmbiguous {
                    txn_id: bad.txn_id,
                    reason: bad.reason,
                }),
            });
        }

        info!(
            target: "hotclone::recovery",
            recovered = report.len(),
            committed = report.count(CloneState::Committed),
            rolled_back = report.count(CloneState::RolledBack),
            partial = report.count(CloneState::PartialFailure),
            ambiguous = report.count(CloneState::Ambiguous),
            "Recovery finished"
        );
        Ok(report)
    }

    fn is_live(&self, record: &TransactionRecord) -> bool {
        record
            .disks
            .keys()
            .any(|disk| self.locks.holder(record.source_vm(), disk) == Some(record.txn_id))
    }

    /// Persisted record of a transaction
    pub fn status(&self, txn_id: TxnId) -> Result<Option<TransactionRecord>> {
        Ok(self.log.get(txn_id)?)
    }

    /// Every readable record, oldest first
    pub fn list(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.log.list()?)
    }

    /// Records the log holds but cannot read
    pub fn corrupt_records(&self) -> Result<Vec<CorruptRecord>> {
        Ok(self.log.corrupt()?)
    }

    /// Delete finished records older than the retention window
    pub fn collect_garbage(&self) -> Result<Vec<TxnId>> {
        Ok(hotclone_durability::collect_garbage(
            &*self.log,
            self.config.retention_policy(),
            Timestamp::now(),
        )?)
    }

    /// Delete a terminal record after an operator resolved it
    ///
    /// # Errors
    ///
    /// `CloneError::Validation` if the transaction is not terminal.
    pub fn forget(&self, txn_id: TxnId) -> Result<bool> {
        match self.log.delete(txn_id) {
            Ok(deleted) => {
                if deleted {
                    info!(target: "hotclone::txn", txn_id = %txn_id, "Transaction record forgotten");
                }
                Ok(deleted)
            }
            Err(LogError::NotTerminal(id)) => Err(CloneError::Validation(format!(
                "transaction {} is not terminal; run recovery first",
                id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for CloneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneManager")
            .field("state_dir", &self.config.state_dir)
            .field("locked_disks", &self.locks.len())
            .field("stalled", &self.stalled.lock().len())
            .finish()
    }
}

/// Handle to a transaction running on its own thread
pub struct CloneHandle {
    txn_id: TxnId,
    cancel: CancellationToken,
    record: Arc<Mutex<TransactionRecord>>,
    join: JoinHandle<Result<CloneReport>>,
}

impl CloneHandle {
    /// Transaction id
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Current in-memory state
    pub fn state(&self) -> CloneState {
        self.record.lock().state
    }

    /// Copy of the current in-memory record
    pub fn record(&self) -> TransactionRecord {
        self.record.lock().clone()
    }

    /// Request cancellation
    ///
    /// Accepted only while the transaction is `SnapshotActive` or
    /// `Copying`. The in-flight hypervisor or copy call is allowed to
    /// return; the transaction then rolls back.
    ///
    /// # Errors
    ///
    /// `CloneError::InvalidTransition` in any other state.
    pub fn cancel(&self) -> Result<()> {
        let state = self.state();
        if !state.is_cancellable() {
            return Err(CloneError::InvalidTransition {
                from: state.to_string(),
                to: CloneState::Failing.to_string(),
            });
        }
        info!(target: "hotclone::txn", txn_id = %self.txn_id, state = %state, "Cancellation requested");
        self.cancel.cancel();
        Ok(())
    }

    /// True once the transaction thread has returned
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the outcome
    pub fn join(self) -> Result<CloneReport> {
        self.join.join().unwrap_or_else(|_| {
            Err(CloneError::Interrupted(
                "transaction thread panicked".to_string(),
            ))
        })
    }
}

impl std::fmt::Debug for CloneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneHandle")
            .field("txn_id", &self.txn_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHypervisor, FakeOp, ScriptedCopier};
    use hotclone_core::DiskState;
    use hotclone_durability::MemoryTransactionLog;
    use tempfile::TempDir;

    #[test]
    fn test_unstarted_rollback_keeps_locks_until_settled() {
        let dir = TempDir::new().unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        hv.add_vm("v1", true);
        hv.add_disk("v1", "d0", dir.path().join("d0.img"), &[7u8; 4096])
            .unwrap();
        let mut config = HotcloneConfig::with_state_dir(dir.path().join("state"));
        config.dest_dir = dir.path().join("out");
        let manager = CloneManager::new(
            config,
            hv.clone(),
            Arc::new(ScriptedCopier::new(1024)),
            Arc::new(MemoryTransactionLog::new()),
        )
        .unwrap();

        let Admitted { mut record, guard } = manager
            .admit(&CloneRequest::new("v1", "v1-clone"))
            .unwrap();
        let txn_id = record.txn_id;
        // crashed mid-create: rollback has to look the snapshot up by name
        record.disks.get_mut(&DiskId::from("d0")).unwrap().state = DiskState::SnapshotCreating;
        hv.fail_always(FakeOp::ListSnapshots, None);

        let err = manager.abandon_unstarted(
            Arc::new(Mutex::new(record)),
            Some(guard),
            CancellationToken::new(),
            "no threads left".to_string(),
        );
        assert!(matches!(err, CloneError::RollbackIncomplete { .. }));
        assert_eq!(
            manager.locks().holder(&VmId::from("v1"), &DiskId::from("d0")),
            Some(txn_id)
        );
        assert_eq!(
            manager.locks().destination_holder(&VmId::from("v1-clone")),
            Some(txn_id)
        );

        hv.clear_faults();
        let report = manager.recover_on_startup().unwrap();
        assert_eq!(report.count(CloneState::RolledBack), 1);
        assert!(manager.locks().is_empty());
    }
}
