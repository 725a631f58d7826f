//! Directory-backed transaction log
//!
//! One file per transaction, `txn-<uuid>.rec`, each holding a single
//! [envelope](crate::envelope). A put writes `txn-<uuid>.rec.tmp`, fsyncs it,
//! renames it over the record file and fsyncs the directory. Rename is atomic
//! on POSIX filesystems, so a crash leaves either the previous record or the
//! new one. Stale `.tmp` files are leftovers of an interrupted put and are
//! removed on open.
//!
//! A record file that fails validation is skipped by `list` with a warning
//! and reported by `corrupt`, so one damaged file never hides the rest of
//! the log. `get` and `delete` on it still fail with `LogError::Corrupt`.
//!
//! The log does not lock its directory against other processes; the clone
//! manager owns that lock for the whole state directory.

use crate::envelope::{decode_record, encode_record};
use crate::error::{LogError, LogResult};
use crate::mode::DurabilityMode;
use crate::transaction_log::{ensure_deletable, sort_records, CorruptRecord, TransactionLog};
use hotclone_core::{TransactionRecord, TxnId};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RECORD_PREFIX: &str = "txn-";
const RECORD_SUFFIX: &str = ".rec";
const TEMP_SUFFIX: &str = ".rec.tmp";

/// Transaction log stored as one file per record
pub struct FileTransactionLog {
    dir: PathBuf,
    mode: DurabilityMode,
    /// Serializes writers so two puts of one record never share a temp file
    write_lock: Mutex<()>,
}

impl FileTransactionLog {
    /// Open (creating if needed) a log directory
    pub fn open(dir: impl AsRef<Path>, mode: DurabilityMode) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log = FileTransactionLog {
            dir,
            mode,
            write_lock: Mutex::new(()),
        };
        let swept = log.sweep_temp_files()?;
        if swept > 0 {
            warn!(target: "hotclone::log", dir = %log.dir.display(), swept, "Removed interrupted record writes");
        }
        debug!(target: "hotclone::log", dir = %log.dir.display(), mode = ?mode, "Transaction log opened");
        Ok(log)
    }

    /// Directory holding the record files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durability mode in effect
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Path of the record file for a transaction
    pub fn record_path(&self, txn_id: TxnId) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", RECORD_PREFIX, txn_id, RECORD_SUFFIX))
    }

    fn temp_path(&self, txn_id: TxnId) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", RECORD_PREFIX, txn_id, TEMP_SUFFIX))
    }

    /// Transaction id encoded in a record file name
    fn parse_file_name(name: &str) -> Option<TxnId> {
        let id = name.strip_prefix(RECORD_PREFIX)?.strip_suffix(RECORD_SUFFIX)?;
        TxnId::from_string(id)
    }

    fn sweep_temp_files(&self) -> LogResult<usize> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                fs::remove_file(entry.path())?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn read_record(&self, path: &Path, expected: TxnId) -> LogResult<Option<TransactionRecord>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        };
        let record = decode_record(&data).map_err(|e| LogError::Corrupt {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        if record.txn_id != expected {
            return Err(LogError::Corrupt {
                path: path.to_path_buf(),
                source: Box::new(LogError::Decode(format!(
                    "file holds transaction {}",
                    record.txn_id
                ))),
            });
        }
        Ok(Some(record))
    }

    /// Read every record file, splitting readable records from corrupt ones
    fn scan(&self) -> LogResult<(Vec<TransactionRecord>, Vec<CorruptRecord>)> {
        let mut records = Vec::new();
        let mut corrupt = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(txn_id) = Self::parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            match self.read_record(&entry.path(), txn_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) if e.is_corruption() => corrupt.push(CorruptRecord {
                    txn_id,
                    path: entry.path(),
                    reason: e.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }
        sort_records(&mut records);
        corrupt.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((records, corrupt))
    }

    fn sync_dir(&self) -> LogResult<()> {
        let dir_fd = File::open(&self.dir)?;
        dir_fd.sync_all()?;
        Ok(())
    }
}

impl TransactionLog for FileTransactionLog {
    fn put(&self, record: &TransactionRecord) -> LogResult<()> {
        let bytes = encode_record(record)?;
        let final_path = self.record_path(record.txn_id);
        let temp_path = self.temp_path(record.txn_id);

        let _guard = self.write_lock.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        if self.mode.requires_fsync() {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp_path, &final_path)?;

        if self.mode.requires_fsync() {
            self.sync_dir()?;
        }

        debug!(
            target: "hotclone::log",
            txn_id = %record.txn_id,
            state = %record.state,
            bytes = bytes.len(),
            "Record persisted"
        );
        Ok(())
    }

    fn get(&self, txn_id: TxnId) -> LogResult<Option<TransactionRecord>> {
        self.read_record(&self.record_path(txn_id), txn_id)
    }

    fn list(&self) -> LogResult<Vec<TransactionRecord>> {
        let (records, corrupt) = self.scan()?;
        for bad in &corrupt {
            warn!(
                target: "hotclone::log",
                txn_id = %bad.txn_id,
                path = %bad.path.display(),
                reason = %bad.reason,
                "Skipping corrupt record"
            );
        }
        Ok(records)
    }

    fn corrupt(&self) -> LogResult<Vec<CorruptRecord>> {
        Ok(self.scan()?.1)
    }

    fn delete(&self, txn_id: TxnId) -> LogResult<bool> {
        let path = self.record_path(txn_id);
        let Some(record) = self.read_record(&path, txn_id)? else {
            return Ok(false);
        };
        ensure_deletable(&record)?;

        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(LogError::Io(e)),
        }
        if self.mode.requires_fsync() {
            self.sync_dir()?;
        }
        debug!(target: "hotclone::log", txn_id = %txn_id, state = %record.state, "Record deleted");
        Ok(true)
    }
}

impl std::fmt::Debug for FileTransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransactionLog")
            .field("dir", &self.dir)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotclone_core::{CloneRequest, CloneState, DiskId, DiskRecord, DiskState};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record() -> TransactionRecord {
        let mut disks = BTreeMap::new();
        disks.insert(DiskId::from("d0"), DiskRecord::new("/src/d0.img", "/dst/d0.img"));
        TransactionRecord::new(TxnId::new(), CloneRequest::new("v1", "v1-clone"), disks)
    }

    #[test]
    fn test_put_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();

        let mut rec = record();
        log.put(&rec).unwrap();
        assert_eq!(log.get(rec.txn_id).unwrap().as_ref(), Some(&rec));

        rec.advance_disk(&DiskId::from("d0"), DiskState::SnapshotCreating)
            .unwrap();
        rec.refresh_state();
        log.put(&rec).unwrap();

        let stored = log.get(rec.txn_id).unwrap().unwrap();
        assert_eq!(stored.state, CloneState::SnapshotCreating);
        assert!(!log.temp_path(rec.txn_id).exists());
    }

    #[test]
    fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
        assert!(log.get(TxnId::new()).unwrap().is_none());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let rec = record();
        {
            let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
            log.put(&rec).unwrap();
        }
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
        assert_eq!(log.list_non_terminal().unwrap(), vec![rec]);
    }

    #[test]
    fn test_delete_requires_terminal() {
        let dir = TempDir::new().unwrap();
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Always).unwrap();
        let mut rec = record();
        log.put(&rec).unwrap();

        assert!(matches!(log.delete(rec.txn_id), Err(LogError::NotTerminal(_))));

        rec.set_state(CloneState::Failing).unwrap();
        rec.set_state(CloneState::RolledBack).unwrap();
        log.put(&rec).unwrap();
        assert!(log.list_non_terminal().unwrap().is_empty());
        assert!(log.delete(rec.txn_id).unwrap());
        assert!(!log.delete(rec.txn_id).unwrap());
        assert!(log.list().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README"), b"not a record").unwrap();
        fs::write(dir.path().join(".lock"), b"").unwrap();
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
        log.put(&record()).unwrap();
        assert_eq!(log.list().unwrap().len(), 1);
        assert!(log.corrupt().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_does_not_hide_others() {
        let dir = TempDir::new().unwrap();
        let log = FileTransactionLog::open(dir.path(), DurabilityMode::Cache).unwrap();
        let good = record();
        log.put(&good).unwrap();

        let bad = TxnId::new();
        fs::write(log.record_path(bad), b"garbage").unwrap();

        assert_eq!(log.list().unwrap(), vec![good.clone()]);
        assert_eq!(log.list_non_terminal().unwrap(), vec![good]);

        let corrupt = log.corrupt().unwrap();
        assert_eq!(corrupt.len(), 1);
        assert_eq!(corrupt[0].txn_id, bad);
        assert_eq!(corrupt[0].path, log.record_path(bad));
        assert!(corrupt[0].reason.contains("corrupt record file"));
    }
}
