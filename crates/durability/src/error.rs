//! Error types for the transaction log

use hotclone_core::{CloneError, TxnId};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Errors raised by [`TransactionLog`](crate::TransactionLog) implementations
#[derive(Debug, Error)]
pub enum LogError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The envelope does not start with the record magic
    #[error("invalid record magic")]
    InvalidMagic,

    /// Envelope written by an unknown format version
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u32),

    /// Stored and computed CRC32 disagree
    #[error("record checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// CRC stored in the trailer
        stored: u32,
        /// CRC computed over header and payload
        computed: u32,
    },

    /// Envelope shorter or longer than its header claims
    #[error("record length mismatch: expected {expected} bytes, found {actual}")]
    LengthMismatch {
        /// Length implied by the header
        expected: usize,
        /// Length on disk
        actual: usize,
    },

    /// MessagePack serialization failed
    #[error("failed to encode record: {0}")]
    Encode(String),

    /// MessagePack deserialization failed
    #[error("failed to decode record: {0}")]
    Decode(String),

    /// A record file failed validation
    #[error("corrupt record file {}: {source}", path.display())]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// Validation failure
        #[source]
        source: Box<LogError>,
    },

    /// Only terminal records may be deleted
    #[error("transaction {0} is not terminal and cannot be deleted")]
    NotTerminal(TxnId),

    /// Write refused by a fault-injecting log
    #[error("injected log failure after {0} writes")]
    Injected(u64),
}

impl LogError {
    /// True for envelope validation failures
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogError::InvalidMagic
                | LogError::UnsupportedVersion(_)
                | LogError::ChecksumMismatch { .. }
                | LogError::LengthMismatch { .. }
                | LogError::Decode(_)
                | LogError::Corrupt { .. }
        )
    }
}

impl From<LogError> for CloneError {
    fn from(e: LogError) -> Self {
        CloneError::Log(e.to_string())
    }
}
