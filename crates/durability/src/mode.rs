//! Durability mode configuration

use serde::{Deserialize, Serialize};

/// When record writes are flushed to stable storage
///
/// | Mode | fsync | Crash window |
/// |------|-------|--------------|
/// | Always | file + parent directory on every put | none |
/// | Cache | never (rename only) | OS page cache |
///
/// `Cache` keeps the write-then-rename atomicity (a crash never exposes a
/// torn record) but a power loss may roll a record back to an older value.
/// It exists for tests and scratch state directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync the record and its directory on every put
    #[default]
    Always,
    /// Skip fsync
    Cache,
}

impl DurabilityMode {
    /// Check if puts must be fsynced
    pub fn requires_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Always => "Always sync (crash and power-loss safe)",
            DurabilityMode::Cache => "Cache (crash safe, may lose writes on power loss)",
        }
    }
}
