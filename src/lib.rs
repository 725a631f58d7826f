//! hotclone - transactional hot cloning of running virtual machines
//!
//! A clone is a write-ahead transaction over every selected disk of a
//! running VM: take a temporary snapshot, copy the frozen base image, merge
//! the snapshot back, and register the new VM. Every step is persisted
//! before it is performed, so a crash at any point is either finished or
//! rolled back by [`CloneManager::recover_on_startup`].
//!
//! # Quick Start
//!
//! ```ignore
//! use hotclone::{CloneManager, CloneRequest, FileBlockCopier, HotcloneConfig, VirshHypervisor};
//! use std::sync::Arc;
//!
//! let config = HotcloneConfig::load_or_default("/etc/hotclone/hotclone.toml".as_ref())?;
//! let hypervisor = Arc::new(VirshHypervisor::new(&config.hypervisor));
//! let copier = Arc::new(FileBlockCopier::new(&config.copy));
//! let manager = CloneManager::open(config, hypervisor, copier)?;
//!
//! manager.recover_on_startup()?;
//! let report = manager.clone_vm(&CloneRequest::new("web-1", "web-1-clone"))?;
//! ```
//!
//! # Architecture
//!
//! The engine crate carries the API; core types, the transaction log, and
//! the disk lock registry are re-exported for callers that plug in their
//! own collaborators.

pub use hotclone_core::{
    AbortSignal, BlockCopier, CloneError, CloneRequest, CloneState, CopyError, CopyProgress,
    DiskId, DiskInfo, DiskKind, DiskRecord, DiskSelection, DiskState, HypervisorClient,
    HypervisorError, Result, SnapshotHandle, SnapshotName, Timestamp, TransactionRecord, TxnId,
    VmId, VmInfo,
};
pub use hotclone_durability::{
    CorruptRecord, DurabilityMode, FileTransactionLog, MemoryTransactionLog, RetentionPolicy,
    TransactionLog,
};
pub use hotclone_engine::*;
