//! Concurrency layer for hotclone
//!
//! This crate provides the two pieces of cross-thread coordination the
//! transaction manager needs:
//! - DiskLockRegistry: mutual exclusion at (source VM, disk) granularity,
//!   plus reservation of destination names and images
//! - CancellationToken: cooperative cancellation observed between steps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod lock_registry;

pub use cancel::{CancellationToken, EitherToken};
pub use lock_registry::{CloneClaim, DiskLockGuard, DiskLockRegistry};
