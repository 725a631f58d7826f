//! Core types and traits for hotclone
//!
//! This crate defines the foundational types used throughout the system:
//! - TxnId, VmId, DiskId: identifiers
//! - CloneRequest: what to clone and where
//! - SnapshotHandle / SnapshotName: temporary snapshots and their naming anchor
//! - CloneState / DiskState: the transaction state machines
//! - TransactionRecord: the durable unit of the transaction log
//! - CloneError: error taxonomy
//! - Traits: collaborator interfaces (HypervisorClient, BlockCopier)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod record;
pub mod state;
pub mod timestamp;
pub mod traits;
pub mod types;

pub use error::{CloneError, CopyError, HypervisorError, Result};
pub use record::{DiskRecord, TransactionRecord};
pub use state::{CloneState, DiskState};
pub use timestamp::Timestamp;
pub use traits::{AbortSignal, BlockCopier, CopyProgress, HypervisorClient, NeverAbort};
pub use types::{
    CloneRequest, DiskId, DiskInfo, DiskKind, DiskSelection, SnapshotHandle, SnapshotName, TxnId,
    VmId, VmInfo,
};
