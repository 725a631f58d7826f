//! Durability layer for hotclone
//!
//! This crate persists clone transaction records:
//! - TransactionLog: the crash-surviving record store contract
//! - FileTransactionLog: one checksummed envelope per record, atomic
//!   write-fsync-rename overwrite
//! - MemoryTransactionLog: volatile store for tests and dry runs
//! - Retention: garbage collection of finished records
//! - Testing: fault-injecting log for crash simulation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod file_log;
pub mod memory_log;
pub mod mode;
pub mod retention;
pub mod testing;
pub mod transaction_log;

pub use error::{LogError, LogResult};
pub use file_log::FileTransactionLog;
pub use memory_log::MemoryTransactionLog;
pub use mode::DurabilityMode;
pub use retention::{collect_garbage, RetentionPolicy};
pub use transaction_log::{CorruptRecord, TransactionLog};
