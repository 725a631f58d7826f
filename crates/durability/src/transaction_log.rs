//! The durable transaction log contract
//!
//! The log is a key-value store keyed by transaction id. It is the only
//! source of truth after a crash: recovery reads it, and every state
//! transition of a clone transaction is written here before the action it
//! authorizes is relied upon.
//!
//! ## Contract
//!
//! - `put` overwrites atomically with respect to a process crash. After a
//!   crash `get` returns either the old or the new record, never a mix.
//! - `list_non_terminal` returns every readable record recovery must look at.
//!   A record that fails validation does not hide the others; it is skipped
//!   by `list` and reported by `corrupt`.
//! - `delete` refuses non-terminal records.

use crate::error::{LogError, LogResult};
use hotclone_core::{TransactionRecord, TxnId};
use std::path::PathBuf;
use std::sync::Arc;

/// A stored record that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// Transaction the record belongs to, from its key
    pub txn_id: TxnId,
    /// Where the record is stored
    pub path: PathBuf,
    /// Why it was rejected
    pub reason: String,
}

/// Durable store of [`TransactionRecord`]s
pub trait TransactionLog: Send + Sync {
    /// Insert or overwrite the record for `record.txn_id`
    fn put(&self, record: &TransactionRecord) -> LogResult<()>;

    /// Fetch one record
    fn get(&self, txn_id: TxnId) -> LogResult<Option<TransactionRecord>>;

    /// Every readable record, oldest first
    fn list(&self) -> LogResult<Vec<TransactionRecord>>;

    /// Delete a terminal record
    ///
    /// Returns `false` if no record exists.
    ///
    /// # Errors
    /// `LogError::NotTerminal` if the record is still live.
    fn delete(&self, txn_id: TxnId) -> LogResult<bool>;

    /// Records skipped by `list` because they failed validation
    fn corrupt(&self) -> LogResult<Vec<CorruptRecord>> {
        Ok(Vec::new())
    }

    /// Records recovery must drive to a terminal state, oldest first
    fn list_non_terminal(&self) -> LogResult<Vec<TransactionRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }
}

impl<T: TransactionLog + ?Sized> TransactionLog for Arc<T> {
    fn put(&self, record: &TransactionRecord) -> LogResult<()> {
        (**self).put(record)
    }

    fn get(&self, txn_id: TxnId) -> LogResult<Option<TransactionRecord>> {
        (**self).get(txn_id)
    }

    fn list(&self) -> LogResult<Vec<TransactionRecord>> {
        (**self).list()
    }

    fn delete(&self, txn_id: TxnId) -> LogResult<bool> {
        (**self).delete(txn_id)
    }

    fn corrupt(&self) -> LogResult<Vec<CorruptRecord>> {
        (**self).corrupt()
    }

    fn list_non_terminal(&self) -> LogResult<Vec<TransactionRecord>> {
        (**self).list_non_terminal()
    }
}

/// Shared guard for `delete` implementations
pub(crate) fn ensure_deletable(record: &TransactionRecord) -> LogResult<()> {
    if record.is_terminal() {
        Ok(())
    } else {
        Err(LogError::NotTerminal(record.txn_id))
    }
}

/// Oldest first, ties broken by id so listings are deterministic
pub(crate) fn sort_records(records: &mut [TransactionRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.txn_id.cmp(&b.txn_id))
    });
}
