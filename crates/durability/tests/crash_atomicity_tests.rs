//! Crash atomicity of the file transaction log
//!
//! A crash during put can leave a temp file behind but never a torn record
//! file. These tests recreate the on-disk leftovers of such crashes and
//! check what a restarted process sees.

use hotclone_core::{CloneRequest, DiskId, DiskRecord, DiskState, Timestamp, TransactionRecord, TxnId};
use hotclone_durability::envelope::encode_record;
use hotclone_durability::{DurabilityMode, FileTransactionLog, LogError, TransactionLog};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

fn record(disks: &[&str]) -> TransactionRecord {
    let map = disks
        .iter()
        .map(|d| {
            (
                DiskId::from(*d),
                DiskRecord::new(format!("/src/{d}.qcow2"), format!("/dst/{d}.qcow2")),
            )
        })
        .collect::<BTreeMap<_, _>>();
    TransactionRecord::new(TxnId::new(), CloneRequest::new("v1", "v1-clone"), map)
}

#[test]
fn test_interrupted_put_keeps_previous_record() {
    let dir = TempDir::new().unwrap();
    let mut rec = record(&["d0"]);
    {
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
        log.put(&rec).unwrap();
    }

    // Crash after writing half of the next version to the temp file
    rec.advance_disk(&DiskId::from("d0"), DiskState::SnapshotCreating)
        .unwrap();
    let next = encode_record(&rec).unwrap();
    let temp = dir.path().join(format!("txn-{}.rec.tmp", rec.txn_id));
    fs::write(&temp, &next[..next.len() / 2]).unwrap();

    let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
    assert!(!temp.exists(), "stale temp file must be swept on open");
    let stored = log.get(rec.txn_id).unwrap().unwrap();
    assert_eq!(stored.disks[&DiskId::from("d0")].state, DiskState::Pending);
}

#[test]
fn test_corrupt_record_is_reported_not_hidden() {
    let dir = TempDir::new().unwrap();
    let rec = record(&["d0", "d1"]);
    let intact = record(&["d2"]);
    let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
    log.put(&rec).unwrap();
    log.put(&intact).unwrap();

    let path = log.record_path(rec.txn_id);
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x55;
    fs::write(&path, &bytes).unwrap();

    // The intact record is still listed; the damaged one is named, not dropped
    assert_eq!(log.list_non_terminal().unwrap(), vec![intact]);
    let corrupt = log.corrupt().unwrap();
    assert_eq!(corrupt.len(), 1);
    assert_eq!(corrupt[0].txn_id, rec.txn_id);
    assert_eq!(corrupt[0].path, path);
    assert!(corrupt[0].reason.contains("checksum mismatch"));

    match log.get(rec.txn_id).unwrap_err() {
        LogError::Corrupt { path: bad, source } => {
            assert_eq!(bad, path);
            assert!(matches!(*source, LogError::ChecksumMismatch { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(log.delete(rec.txn_id).unwrap_err().is_corruption());
}

#[test]
fn test_record_under_wrong_name_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let rec = record(&["d0"]);
    let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
    log.put(&rec).unwrap();

    let other = TxnId::new();
    fs::rename(log.record_path(rec.txn_id), log.record_path(other)).unwrap();
    assert!(matches!(log.get(other), Err(LogError::Corrupt { .. })));
}

#[test]
fn test_list_orders_oldest_first() {
    let dir = TempDir::new().unwrap();
    let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
    let mut first = record(&["d0"]);
    let mut second = record(&["d0"]);
    first.created_at = Timestamp::from_secs(10);
    second.created_at = Timestamp::from_secs(20);
    log.put(&second).unwrap();
    log.put(&first).unwrap();

    let ids: Vec<_> = log.list().unwrap().into_iter().map(|r| r.txn_id).collect();
    assert_eq!(ids, vec![first.txn_id, second.txn_id]);
}

fn disk_state() -> impl Strategy<Value = DiskState> {
    prop_oneof![
        Just(DiskState::Pending),
        Just(DiskState::SnapshotCreating),
        Just(DiskState::SnapshotActive),
        Just(DiskState::Copying),
        Just(DiskState::Copied),
        Just(DiskState::Merging),
        Just(DiskState::Committed),
        Just(DiskState::Discarded),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever sequence of overwrites happened, a reopened log returns the last one
    #[test]
    fn prop_last_put_wins_across_reopen(
        states in prop::collection::vec((disk_state(), any::<u64>()), 1..12),
    ) {
        let dir = TempDir::new().unwrap();
        let mut rec = record(&["d0"]);
        {
            let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
            for (state, bytes) in &states {
                let disk = rec.disks.get_mut(&DiskId::from("d0")).unwrap();
                disk.state = *state;
                disk.bytes_copied = *bytes;
                log.put(&rec).unwrap();
            }
        }
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
        prop_assert_eq!(log.get(rec.txn_id).unwrap(), Some(rec.clone()));
        prop_assert_eq!(log.list().unwrap().len(), 1);
    }
}
