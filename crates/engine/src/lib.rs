//! Hot-clone transaction engine
//!
//! This crate orchestrates the lower layers:
//! - CloneManager: admission, per-disk locking, startup recovery
//! - CloneTransaction: the write-ahead snapshot/copy/merge state machine
//! - Recovery planning: reconciling the log with the hypervisor after a crash
//! - Configuration (`hotclone.toml`) and progress checkpointing
//! - Adapters for a libvirt host, and in-process fakes for tests
//!
//! The engine is the only component that talks to the hypervisor and the
//! copier; core types and the transaction log know nothing about them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod manager;
pub mod plan;
pub mod progress;
pub mod recovery;
pub mod testing;
pub mod transaction;

pub use adapters::{FileBlockCopier, VirshHypervisor};
pub use config::{
    CopyConfig, HotcloneConfig, HypervisorConfig, ProgressConfig, RecoveryPolicy,
    CONFIG_FILE_NAME,
};
pub use manager::{CloneHandle, CloneManager, CloneReport};
pub use plan::{plan_clone, ClonePlan};
pub use recovery::{plan_recovery, RecoveryAction, RecoveryOutcome, RecoveryPlan, RecoveryReport};
pub use transaction::{CloneTransaction, TxnContext};

pub use hotclone_durability::CorruptRecord;
