//! Retention of finished transaction records
//!
//! Terminal records are kept for a while so operators can inspect recent
//! clones, then garbage collected.
//!
//! # Policy Types
//!
//! - **KeepAll**: never collect
//! - **KeepFor(duration)**: collect once `last_updated` is older than the window
//!
//! Only `Committed` and `RolledBack` records are ever collected.
//! `PartialFailure` and `Ambiguous` records wait for an operator to resolve
//! them and delete the record explicitly.

use crate::error::LogResult;
use crate::transaction_log::TransactionLog;
use hotclone_core::{Timestamp, TransactionRecord, TxnId};
use std::time::Duration;
use tracing::{debug, info};

/// How long collectable records are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Keep every record
    #[default]
    KeepAll,
    /// Keep records updated within the window
    KeepFor(Duration),
}

impl RetentionPolicy {
    /// Window in seconds; `0` keeps everything
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            RetentionPolicy::KeepAll
        } else {
            RetentionPolicy::KeepFor(Duration::from_secs(secs))
        }
    }

    /// Should this record be deleted at `now`
    pub fn is_expired(&self, record: &TransactionRecord, now: Timestamp) -> bool {
        if !record.state.is_collectable() {
            return false;
        }
        match self {
            RetentionPolicy::KeepAll => false,
            RetentionPolicy::KeepFor(window) => now
                .duration_since(record.last_updated)
                .map_or(false, |age| age >= *window),
        }
    }
}

/// Delete every expired record, returning the collected ids
pub fn collect_garbage(
    log: &dyn TransactionLog,
    policy: RetentionPolicy,
    now: Timestamp,
) -> LogResult<Vec<TxnId>> {
    let mut collected = Vec::new();
    for record in log.list()? {
        if !policy.is_expired(&record, now) {
            continue;
        }
        if log.delete(record.txn_id)? {
            debug!(target: "hotclone::log", txn_id = %record.txn_id, state = %record.state, "Record collected");
            collected.push(record.txn_id);
        }
    }
    if !collected.is_empty() {
        info!(target: "hotclone::log", count = collected.len(), "Garbage collected finished transactions");
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_log::MemoryTransactionLog;
    use hotclone_core::{CloneRequest, CloneState};
    use std::collections::BTreeMap;

    fn record_in(state: CloneState, updated: Timestamp) -> TransactionRecord {
        let mut rec = TransactionRecord::new(
            TxnId::new(),
            CloneRequest::new("v1", "v1-clone"),
            BTreeMap::new(),
        );
        rec.state = state;
        rec.last_updated = updated;
        rec
    }

    #[test]
    fn test_keep_all_never_expires() {
        let rec = record_in(CloneState::Committed, Timestamp::EPOCH);
        assert!(!RetentionPolicy::KeepAll.is_expired(&rec, Timestamp::now()));
        assert_eq!(RetentionPolicy::from_secs(0), RetentionPolicy::KeepAll);
    }

    #[test]
    fn test_only_collectable_states_expire() {
        let policy = RetentionPolicy::from_secs(60);
        let now = Timestamp::from_secs(10_000);
        let old = Timestamp::from_secs(1_000);

        assert!(policy.is_expired(&record_in(CloneState::Committed, old), now));
        assert!(policy.is_expired(&record_in(CloneState::RolledBack, old), now));
        assert!(!policy.is_expired(&record_in(CloneState::PartialFailure, old), now));
        assert!(!policy.is_expired(&record_in(CloneState::Ambiguous, old), now));
        assert!(!policy.is_expired(&record_in(CloneState::Copying, old), now));
        assert!(!policy.is_expired(&record_in(CloneState::Committed, Timestamp::from_secs(9_990)), now));
    }

    #[test]
    fn test_collect_garbage_deletes_expired() {
        let log = MemoryTransactionLog::new();
        let now = Timestamp::from_secs(10_000);
        let expired = record_in(CloneState::Committed, Timestamp::from_secs(1));
        let fresh = record_in(CloneState::Committed, Timestamp::from_secs(9_999));
        let partial = record_in(CloneState::PartialFailure, Timestamp::from_secs(1));
        for rec in [&expired, &fresh, &partial] {
            log.put(rec).unwrap();
        }

        let collected = collect_garbage(&log, RetentionPolicy::from_secs(3600), now).unwrap();
        assert_eq!(collected, vec![expired.txn_id]);
        assert_eq!(log.len(), 2);
    }
}
