//! In-memory transaction log
//!
//! Records are stored as encoded envelopes so every put exercises the same
//! serialization path as the file log. Clones share the same store, which
//! lets a test "crash" a manager and recover from the surviving log.

use crate::envelope::{decode_record, encode_record};
use crate::error::LogResult;
use crate::transaction_log::{ensure_deletable, sort_records, TransactionLog};
use hotclone_core::{TransactionRecord, TxnId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Volatile log, shared between clones
#[derive(Clone, Default)]
pub struct MemoryTransactionLog {
    records: Arc<Mutex<BTreeMap<TxnId, Vec<u8>>>>,
}

impl MemoryTransactionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if no record is stored
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn put(&self, record: &TransactionRecord) -> LogResult<()> {
        let bytes = encode_record(record)?;
        self.records.lock().insert(record.txn_id, bytes);
        Ok(())
    }

    fn get(&self, txn_id: TxnId) -> LogResult<Option<TransactionRecord>> {
        let records = self.records.lock();
        records.get(&txn_id).map(|b| decode_record(b)).transpose()
    }

    fn list(&self) -> LogResult<Vec<TransactionRecord>> {
        let mut out = {
            let records = self.records.lock();
            records
                .values()
                .map(|b| decode_record(b))
                .collect::<LogResult<Vec<_>>>()?
        };
        sort_records(&mut out);
        Ok(out)
    }

    fn delete(&self, txn_id: TxnId) -> LogResult<bool> {
        let mut records = self.records.lock();
        let Some(bytes) = records.get(&txn_id) else {
            return Ok(false);
        };
        ensure_deletable(&decode_record(bytes)?)?;
        records.remove(&txn_id);
        Ok(true)
    }
}

impl std::fmt::Debug for MemoryTransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransactionLog")
            .field("records", &self.len())
            .finish()
    }
}
