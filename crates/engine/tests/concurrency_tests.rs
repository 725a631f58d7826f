//! Admission and Cancellation Tests
//!
//! Validates (VM, disk) mutual exclusion and destination reservation across
//! concurrently running transactions, and cooperative cancellation of a
//! running copy.

use hotclone_core::{CloneError, CloneRequest, CloneState};
use hotclone_durability::MemoryTransactionLog;
use hotclone_engine::testing::{FakeHypervisor, ScriptedCopier};
use hotclone_engine::{CloneHandle, CloneManager, HotcloneConfig};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn setup(disks: &[&str]) -> (TempDir, Arc<FakeHypervisor>, Arc<ScriptedCopier>, Arc<CloneManager>) {
    let dir = TempDir::new().unwrap();
    let hv = Arc::new(FakeHypervisor::new());
    hv.add_vm("v1", true);
    for disk in disks {
        hv.add_disk("v1", disk, dir.path().join(format!("{}.img", disk)), &[7u8; 8192])
            .unwrap();
    }
    let copier = Arc::new(ScriptedCopier::new(1024));
    let mut config = HotcloneConfig::with_state_dir(dir.path().join("state"));
    config.dest_dir = dir.path().join("out");
    let manager = CloneManager::new(
        config,
        hv.clone(),
        copier.clone(),
        Arc::new(MemoryTransactionLog::new()),
    )
    .unwrap();
    (dir, hv, copier, Arc::new(manager))
}

fn wait_for_state(handle: &CloneHandle, state: CloneState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.state() != state {
        assert!(Instant::now() < deadline, "stuck in {}", handle.state());
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Mutual exclusion
// ============================================================================

/// Test: two requests for the same disk race; exactly one is admitted
#[test]
fn test_same_disk_admits_exactly_one() {
    let (_dir, hv, copier, manager) = setup(&["d0"]);
    copier.block_until_cancelled();

    let barrier = Arc::new(Barrier::new(2));
    let racers: Vec<_> = ["v1-a", "v1-b"]
        .into_iter()
        .map(|dest| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.spawn(&CloneRequest::new("v1", dest))
            })
        })
        .collect();
    let results: Vec<_> = racers.into_iter().map(|t| t.join().unwrap()).collect();

    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(CloneError::Conflict { .. })))
        .count();
    assert_eq!(conflicts, 1);

    let handle = results.into_iter().find_map(Result::ok).unwrap();
    wait_for_state(&handle, CloneState::Copying);
    handle.cancel().unwrap();
    assert!(matches!(handle.join(), Err(CloneError::RolledBack { .. })));
    assert_eq!(hv.snapshot_count("v1"), 0);
    assert!(manager.locks().is_empty());
}

/// Test: the conflict names the disk and the holder
#[test]
fn test_conflict_reports_holder() {
    let (_dir, _hv, copier, manager) = setup(&["d0", "d1"]);
    copier.block_until_cancelled();

    let first = manager
        .spawn(&CloneRequest::new("v1", "v1-a").with_disks(["d0"]))
        .unwrap();
    let err = manager
        .spawn(&CloneRequest::new("v1", "v1-b"))
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);
    match err {
        CloneError::Conflict { disk, holder, .. } => {
            assert_eq!(disk.as_str(), "d0");
            assert_eq!(holder, first.txn_id());
        }
        other => panic!("unexpected error {other:?}"),
    }

    // a different disk of the same VM is independent
    let second = manager
        .spawn(&CloneRequest::new("v1", "v1-c").with_disks(["d1"]))
        .unwrap();

    for handle in [first, second] {
        wait_for_state(&handle, CloneState::Copying);
        handle.cancel().unwrap();
        assert!(handle.join().is_err());
    }
    assert!(manager.locks().is_empty());
}

/// Test: clones of two VMs to the same name collide on the reserved
/// destination, not on the filesystem
#[test]
fn test_destination_name_is_reserved_while_running() {
    let (dir, hv, copier, manager) = setup(&["d0"]);
    hv.add_vm("v2", true);
    hv.add_disk("v2", "d0", dir.path().join("v2-d0.img"), &[9u8; 8192])
        .unwrap();
    copier.block_until_cancelled();

    let first = manager.spawn(&CloneRequest::new("v1", "shared")).unwrap();
    wait_for_state(&first, CloneState::Copying);

    // both requests would default to <dest_dir>/shared-d0.img
    let err = manager.spawn(&CloneRequest::new("v2", "shared")).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    match err {
        CloneError::DestinationReserved { target, holder } => {
            assert_eq!(target, "VM shared");
            assert_eq!(holder, first.txn_id());
        }
        other => panic!("unexpected error {other:?}"),
    }

    // an explicit path onto the running copy is refused as well
    let taken = dir.path().join("out").join("shared-d0.img");
    let err = manager
        .spawn(&CloneRequest::new("v2", "other").with_destination_path("d0", taken.clone()))
        .unwrap_err();
    assert!(matches!(err, CloneError::DestinationReserved { ref target, .. } if target.contains("shared-d0.img")));

    first.cancel().unwrap();
    assert!(first.join().is_err());
    assert!(manager.locks().is_empty());
    assert_eq!(manager.locks().destination_holder(&"shared".into()), None);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Test: cancelling during the copy rolls the transaction back
#[test]
fn test_cancel_during_copy_rolls_back() {
    let (dir, hv, copier, manager) = setup(&["d0"]);
    copier.block_until_cancelled();

    let handle = manager.spawn(&CloneRequest::new("v1", "v1-clone")).unwrap();
    let txn_id = handle.txn_id();
    wait_for_state(&handle, CloneState::Copying);
    handle.cancel().unwrap();

    match handle.join() {
        Err(CloneError::RolledBack { cause, .. }) => {
            assert!(matches!(*cause, CloneError::Cancelled));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(hv.snapshot_count("v1"), 0);
    assert!(!hv.vm_exists("v1-clone"));
    assert!(!dir.path().join("out").join("v1-clone-d0.img").exists());
    let record = manager.status(txn_id).unwrap().unwrap();
    assert_eq!(record.state, CloneState::RolledBack);
}

/// Test: cancellation is refused once the transaction finished
#[test]
fn test_cancel_after_commit_is_refused() {
    let (_dir, _hv, _copier, manager) = setup(&["d0"]);
    let handle = manager.spawn(&CloneRequest::new("v1", "v1-clone")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handle.state(), CloneState::Committed);
    assert!(matches!(
        handle.cancel(),
        Err(CloneError::InvalidTransition { .. })
    ));
    let report = handle.join().unwrap();
    assert_eq!(report.bytes_copied, 8192);
}
