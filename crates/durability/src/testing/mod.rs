//! Testing utilities for the transaction log
//!
//! [`FaultyLog`] simulates a process crash at an exact point of a clone
//! transaction: it forwards a fixed number of puts to an inner log and
//! refuses every write after that. From the transaction's point of view the
//! log died; the inner log holds exactly what a crashed process would have
//! left on disk, ready for recovery.
//!
//! # Example
//!
//! ```ignore
//! use hotclone_durability::testing::FaultyLog;
//! use hotclone_durability::MemoryTransactionLog;
//!
//! let disk = MemoryTransactionLog::new();
//! let log = FaultyLog::new(disk.clone(), 3); // the 4th put "crashes"
//! ```

use crate::error::{LogError, LogResult};
use crate::transaction_log::{CorruptRecord, TransactionLog};
use hotclone_core::{TransactionRecord, TxnId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Log wrapper that fails every write after a budget is spent
pub struct FaultyLog<L> {
    inner: L,
    budget: u64,
    writes: AtomicU64,
    tripped: AtomicBool,
}

impl<L: TransactionLog> FaultyLog<L> {
    /// Allow `budget` successful puts, then fail
    pub fn new(inner: L, budget: u64) -> Self {
        FaultyLog {
            inner,
            budget,
            writes: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// Puts that reached the inner log
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// True once a write was refused
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// The surviving log
    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn admit(&self) -> LogResult<()> {
        if self.tripped() {
            return Err(LogError::Injected(self.budget));
        }
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n >= self.budget {
            self.writes.fetch_sub(1, Ordering::SeqCst);
            self.tripped.store(true, Ordering::SeqCst);
            return Err(LogError::Injected(self.budget));
        }
        Ok(())
    }
}

impl<L: TransactionLog> TransactionLog for FaultyLog<L> {
    fn put(&self, record: &TransactionRecord) -> LogResult<()> {
        self.admit()?;
        self.inner.put(record)
    }

    fn get(&self, txn_id: TxnId) -> LogResult<Option<TransactionRecord>> {
        self.inner.get(txn_id)
    }

    fn list(&self) -> LogResult<Vec<TransactionRecord>> {
        self.inner.list()
    }

    fn delete(&self, txn_id: TxnId) -> LogResult<bool> {
        self.admit()?;
        self.inner.delete(txn_id)
    }

    fn corrupt(&self) -> LogResult<Vec<CorruptRecord>> {
        self.inner.corrupt()
    }
}
