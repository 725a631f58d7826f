//! Crash Simulation Tests
//!
//! A crash is simulated by a transaction log that refuses every write after
//! a budget: the transaction stops exactly where a killed process would.
//! A second manager over the surviving log and the same hypervisor then
//! runs startup recovery.
//!
//! Key properties:
//! - recovery always ends in a terminal state
//! - clean outcomes leave no snapshot of the transaction behind
//! - rolled back transactions register no destination VM
//! - committed clones are byte-identical to the source at snapshot time

use hotclone_core::{
    CloneError, CloneRequest, CloneState, DiskId, DiskState, HypervisorClient, SnapshotName,
    TransactionRecord, TxnId, VmId,
};
use hotclone_durability::testing::FaultyLog;
use hotclone_durability::{MemoryTransactionLog, TransactionLog};
use hotclone_engine::testing::{FakeHypervisor, ScriptedCopier};
use hotclone_engine::{plan_clone, CloneManager, HotcloneConfig, RecoveryPolicy};
use proptest::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const DISK_SIZE: usize = 12 * 1024;

fn content(seed: u8) -> Vec<u8> {
    (0..DISK_SIZE).map(|i| (i as u8) ^ seed).collect()
}

struct World {
    dir: TempDir,
    hv: Arc<FakeHypervisor>,
    copier: Arc<ScriptedCopier>,
    log: MemoryTransactionLog,
    config: HotcloneConfig,
}

fn world(disks: usize, policy: RecoveryPolicy) -> World {
    let dir = TempDir::new().unwrap();
    let hv = Arc::new(FakeHypervisor::new());
    hv.add_vm("v1", true);
    for i in 0..disks {
        hv.add_disk(
            "v1",
            &format!("d{}", i),
            dir.path().join(format!("d{}.img", i)),
            &content(i as u8),
        )
        .unwrap();
    }
    let mut config = HotcloneConfig::with_state_dir(dir.path().join("state"));
    config.dest_dir = dir.path().join("out");
    config.max_parallel_disks = 2;
    config.recovery = policy;
    config.progress.checkpoint_bytes = 4096;
    World {
        dir,
        hv,
        copier: Arc::new(ScriptedCopier::new(4096)),
        log: MemoryTransactionLog::new(),
        config,
    }
}

impl World {
    fn manager_over(&self, log: Arc<dyn TransactionLog>) -> CloneManager {
        CloneManager::new(self.config.clone(), self.hv.clone(), self.copier.clone(), log).unwrap()
    }

    /// A fresh process over the surviving log
    fn restart(&self) -> CloneManager {
        self.manager_over(Arc::new(self.log.clone()))
    }

    fn dest(&self, disk: &str) -> PathBuf {
        self.dir.path().join("out").join(format!("v1-clone-{}.img", disk))
    }

    /// Persist a record as if a process had crashed with it in flight
    fn seed_record(&self, edit: impl FnOnce(&mut TransactionRecord)) -> TxnId {
        let request = CloneRequest::new("v1", "v1-clone");
        let txn_id = TxnId::new();
        let mut record = plan_clone(&*self.hv, &self.config, &request)
            .unwrap()
            .into_record(txn_id);
        edit(&mut record);
        self.log.put(&record).unwrap();
        txn_id
    }

    fn snapshot_disk(&self, txn_id: TxnId, disk: &str) -> hotclone_core::SnapshotHandle {
        let disk = DiskId::from(disk);
        self.hv
            .create_snapshot(txn_id, &VmId::from("v1"), &disk, &SnapshotName::for_disk(txn_id, &disk))
            .unwrap()
    }
}

fn set_disk(record: &mut TransactionRecord, disk: &str, state: DiskState) {
    record.disks.get_mut(&DiskId::from(disk)).unwrap().state = state;
}

// ============================================================================
// Crash at every persisted step
// ============================================================================

fn crash_and_recover(disks: usize, budget: u64, policy: RecoveryPolicy) -> Result<(), TestCaseError> {
    let w = world(disks, policy);
    let faulty = Arc::new(FaultyLog::new(w.log.clone(), budget));
    let outcome = w
        .manager_over(faulty.clone())
        .clone_vm(&CloneRequest::new("v1", "v1-clone"));

    match &outcome {
        Ok(_) => prop_assert!(!faulty.tripped()),
        Err(e) => prop_assert!(matches!(e, CloneError::Log(_)), "unexpected {:?}", e),
    }

    let recovered = w.restart();
    let report = recovered.recover_on_startup().unwrap();
    prop_assert!(!report.needs_operator(), "report {:?}", report);
    prop_assert!(recovered.locks().is_empty());

    let records = w.log.list().unwrap();
    prop_assert!(records.len() <= 1);
    // budget 0: the admission write itself failed, nothing happened
    let Some(record) = records.into_iter().next() else {
        prop_assert_eq!(w.hv.calls(hotclone_engine::testing::FakeOp::CreateSnapshot), 0);
        return Ok(());
    };

    prop_assert!(record.is_terminal());
    prop_assert_eq!(w.hv.snapshot_count("v1"), 0);
    match record.state {
        CloneState::Committed => {
            prop_assert!(w.hv.vm_exists("v1-clone"));
            for i in 0..disks {
                let got = fs::read(w.dest(&format!("d{}", i))).unwrap();
                prop_assert_eq!(got, content(i as u8));
            }
        }
        CloneState::RolledBack => {
            prop_assert!(!w.hv.vm_exists("v1-clone"));
            for i in 0..disks {
                let name = format!("d{}", i);
                prop_assert!(!w.dest(&name).exists());
            }
        }
        other => prop_assert!(false, "unexpected terminal state {}", other),
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_recovery_terminates_after_any_crash(
        disks in 1usize..=3,
        budget in 0u64..40,
        rollback in any::<bool>(),
    ) {
        let policy = if rollback { RecoveryPolicy::Rollback } else { RecoveryPolicy::Resume };
        crash_and_recover(disks, budget, policy)?;
    }
}

/// Test: every crash point of a single-disk clone, resumed forward
#[test]
fn test_every_crash_point_resumes_to_commit() {
    for budget in 1..16 {
        let w = world(1, RecoveryPolicy::Resume);
        let faulty = Arc::new(FaultyLog::new(w.log.clone(), budget));
        let _ = w
            .manager_over(faulty)
            .clone_vm(&CloneRequest::new("v1", "v1-clone"));

        w.restart().recover_on_startup().unwrap();
        let record = w.log.list().unwrap().remove(0);
        assert_eq!(record.state, CloneState::Committed, "budget {}", budget);
        assert_eq!(fs::read(w.dest("d0")).unwrap(), content(0));
        assert_eq!(w.hv.snapshot_count("v1"), 0);
    }
}

// ============================================================================
// Recovery decisions
// ============================================================================

/// Test: a crash mid-copy restarts the copy from zero
#[test]
fn test_interrupted_copy_restarts_from_zero() {
    let w = world(1, RecoveryPolicy::Resume);
    let txn_id = TxnId::new();
    let handle = w.snapshot_disk(txn_id, "d0");
    fs::create_dir_all(w.dir.path().join("out")).unwrap();
    let seeded = w.seed_record(|r| {
        r.txn_id = txn_id;
        let d0 = r.disks.get_mut(&DiskId::from("d0")).unwrap();
        d0.state = DiskState::Copying;
        d0.snapshot = Some(handle);
        d0.copy_attempts = 1;
        d0.bytes_copied = 4096;
    });
    fs::write(w.dest("d0"), b"torn write").unwrap();

    let report = w.restart().recover_on_startup().unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report.count(CloneState::Committed), 1);
    assert_eq!(report.exit_code(), 0);

    let record = w.log.get(seeded).unwrap().unwrap();
    let d0 = &record.disks[&DiskId::from("d0")];
    assert_eq!(d0.copy_attempts, 2);
    assert_eq!(d0.bytes_copied, DISK_SIZE as u64);
    assert_eq!(fs::read(w.dest("d0")).unwrap(), content(0));
    assert_eq!(w.hv.snapshot_count("v1"), 0);
}

/// Test: a snapshot created just before the crash is adopted by name
#[test]
fn test_orphan_snapshot_is_adopted() {
    let w = world(1, RecoveryPolicy::Resume);
    let txn_id = TxnId::new();
    w.snapshot_disk(txn_id, "d0");
    w.seed_record(|r| {
        r.txn_id = txn_id;
        set_disk(r, "d0", DiskState::SnapshotCreating);
    });

    let report = w.restart().recover_on_startup().unwrap();
    assert_eq!(report.count(CloneState::Committed), 1);
    assert_eq!(w.hv.snapshot_count("v1"), 0);
}

/// Test: the rollback policy rolls back work before the merge point
#[test]
fn test_rollback_policy() {
    let w = world(2, RecoveryPolicy::Rollback);
    let txn_id = TxnId::new();
    let handle = w.snapshot_disk(txn_id, "d0");
    fs::create_dir_all(w.dir.path().join("out")).unwrap();
    w.seed_record(|r| {
        r.txn_id = txn_id;
        let d0 = r.disks.get_mut(&DiskId::from("d0")).unwrap();
        d0.state = DiskState::Copying;
        d0.snapshot = Some(handle);
    });
    fs::write(w.dest("d0"), b"partial").unwrap();

    let report = w.restart().recover_on_startup().unwrap();
    assert_eq!(report.count(CloneState::RolledBack), 1);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(w.hv.snapshot_count("v1"), 0);
    assert!(!w.dest("d0").exists());
    assert!(!w.hv.vm_exists("v1-clone"));
}

/// Test: a disk past the merge point forces forward recovery
#[test]
fn test_merge_point_forces_forward() {
    let w = world(2, RecoveryPolicy::Rollback);
    let txn_id = TxnId::new();
    let handle = w.snapshot_disk(txn_id, "d0");
    // the merge landed, the delete did not
    w.hv.merge_snapshot(&handle).unwrap();
    w.seed_record(|r| {
        r.txn_id = txn_id;
        let d0 = r.disks.get_mut(&DiskId::from("d0")).unwrap();
        d0.state = DiskState::Merging;
        d0.snapshot = Some(handle);
    });
    fs::create_dir_all(w.dir.path().join("out")).unwrap();
    fs::write(w.dest("d0"), content(0)).unwrap();

    let report = w.restart().recover_on_startup().unwrap();
    assert_eq!(report.count(CloneState::Committed), 1);
    assert_eq!(fs::read(w.dest("d1")).unwrap(), content(1));
    assert_eq!(w.hv.snapshot_count("v1"), 0);
    assert!(w.hv.vm_exists("v1-clone"));
}

/// Test: a recorded snapshot the hypervisor no longer has is ambiguous
#[test]
fn test_vanished_snapshot_is_ambiguous() {
    let w = world(1, RecoveryPolicy::Resume);
    let txn_id = TxnId::new();
    let handle = w.snapshot_disk(txn_id, "d0");
    w.hv.merge_snapshot(&handle).unwrap();
    w.hv.delete_snapshot(&handle).unwrap();
    let seeded = w.seed_record(|r| {
        r.txn_id = txn_id;
        let d0 = r.disks.get_mut(&DiskId::from("d0")).unwrap();
        d0.state = DiskState::Copied;
        d0.snapshot = Some(handle);
    });

    let manager = w.restart();
    let report = manager.recover_on_startup().unwrap();
    assert_eq!(report.count(CloneState::Ambiguous), 1);
    assert!(report.needs_operator());
    assert_eq!(report.exit_code(), 6);
    assert_eq!(
        manager.status(seeded).unwrap().unwrap().state,
        CloneState::Ambiguous
    );

    // ambiguous records are terminal: a second pass leaves them alone
    assert!(manager.recover_on_startup().unwrap().is_empty());
    assert!(manager.forget(seeded).unwrap());
}

/// Test: a failed log write leaves the disks locked in the crashed process
#[test]
fn test_log_failure_keeps_disks_locked() {
    let w = world(1, RecoveryPolicy::Resume);
    let faulty = Arc::new(FaultyLog::new(w.log.clone(), 3));
    let manager = w.manager_over(faulty);

    let err = manager
        .clone_vm(&CloneRequest::new("v1", "v1-clone"))
        .unwrap_err();
    assert!(matches!(err, CloneError::Log(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(!manager.locks().is_empty());

    let again = manager.clone_vm(&CloneRequest::new("v1", "v1-other"));
    assert!(matches!(again, Err(CloneError::Conflict { .. })));
}
