//! Cooperative cancellation
//!
//! Cancelling a transaction never interrupts an in-flight hypervisor or copy
//! call. The token is only observed at step boundaries and between copy
//! chunks; the transaction then turns the cancellation into a rollback.

use hotclone_core::AbortSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
///
/// Cloning the token shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an unset token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl AbortSignal for CancellationToken {
    fn is_aborted(&self) -> bool {
        self.is_cancelled()
    }
}

/// Fires when either of two tokens fires
///
/// A disk copy stops when the caller cancels the transaction or when a
/// sibling disk failed.
pub struct EitherToken<'a> {
    first: &'a CancellationToken,
    second: &'a CancellationToken,
}

impl<'a> EitherToken<'a> {
    /// Combine two tokens
    pub fn new(first: &'a CancellationToken, second: &'a CancellationToken) -> Self {
        EitherToken { first, second }
    }
}

impl AbortSignal for EitherToken<'_> {
    fn is_aborted(&self) -> bool {
        self.first.is_cancelled() || self.second.is_cancelled()
    }
}
