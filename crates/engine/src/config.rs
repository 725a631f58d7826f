//! Configuration via `hotclone.toml`
//!
//! Every field is optional; a missing file or an empty file yields the
//! defaults. On first use the CLI writes a commented default file next to
//! the state directory. Command-line flags override file values.

use hotclone_core::CloneError;
use hotclone_durability::{DurabilityMode, RetentionPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name
pub const CONFIG_FILE_NAME: &str = "hotclone.toml";

/// What recovery does with a transaction that crashed before any disk
/// crossed the merge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Continue the transaction forward
    #[default]
    Resume,
    /// Roll the transaction back
    Rollback,
}

/// Coalescing of copy-progress checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Persist progress after this many new bytes
    #[serde(default = "default_checkpoint_bytes")]
    pub checkpoint_bytes: u64,
    /// ...or after this much time, whichever comes first
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
}

fn default_checkpoint_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_checkpoint_interval_ms() -> u64 {
    5000
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            checkpoint_bytes: default_checkpoint_bytes(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

impl ProgressConfig {
    /// Time threshold as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Settings of the built-in file copier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Bytes read per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Skip writing all-zero chunks
    #[serde(default = "default_true")]
    pub sparse: bool,
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            sparse: true,
        }
    }
}

/// Settings of the virsh adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Libvirt connection URI; the virsh default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Directory for snapshot overlays; beside the base image when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Ask the guest agent to quiesce filesystems while snapshotting
    #[serde(default)]
    pub quiesce: bool,
}

/// Configuration loaded from `hotclone.toml`
///
/// # Example
///
/// ```toml
/// state_dir = "/var/lib/hotclone"
/// max_parallel_disks = 2
/// recovery = "rollback"
///
/// [hypervisor]
/// uri = "qemu:///system"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotcloneConfig {
    /// Transaction log directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Default directory for destination images
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,
    /// Disks of one transaction copied concurrently
    #[serde(default = "default_max_parallel_disks")]
    pub max_parallel_disks: usize,
    /// Crash handling before the merge point
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    /// Reject requests whose source VM is not running
    #[serde(default = "default_true")]
    pub require_running: bool,
    /// Retention window for finished records; `0` keeps them forever
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Log flush behavior
    #[serde(default)]
    pub durability: DurabilityMode,
    /// Progress checkpointing
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Built-in copier
    #[serde(default)]
    pub copy: CopyConfig,
    /// Hypervisor adapter
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/hotclone")
}

fn default_dest_dir() -> PathBuf {
    PathBuf::from("/var/lib/libvirt/images")
}

fn default_max_parallel_disks() -> usize {
    4
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for HotcloneConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            dest_dir: default_dest_dir(),
            max_parallel_disks: default_max_parallel_disks(),
            recovery: RecoveryPolicy::default(),
            require_running: true,
            retention_secs: default_retention_secs(),
            durability: DurabilityMode::default(),
            progress: ProgressConfig::default(),
            copy: CopyConfig::default(),
            hypervisor: HypervisorConfig::default(),
        }
    }
}

impl HotcloneConfig {
    /// Defaults rooted at `state_dir`, handy for tests and scratch runs
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Retention policy for garbage collection
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_secs(self.retention_secs)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns `CloneError::Config` if `max_parallel_disks` or
    /// `copy.chunk_size` is zero.
    pub fn validate(&self) -> Result<(), CloneError> {
        if self.max_parallel_disks == 0 {
            return Err(CloneError::Config(
                "max_parallel_disks must be at least 1".to_string(),
            ));
        }
        if self.copy.chunk_size == 0 {
            return Err(CloneError::Config(
                "copy.chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# hotclone configuration

# Directory holding the transaction log (one record file per clone)
state_dir = "/var/lib/hotclone"

# Default directory for destination images
dest_dir = "/var/lib/libvirt/images"

# Disks of one VM copied concurrently
max_parallel_disks = 4

# Crash before any disk merged: "resume" continues, "rollback" aborts
recovery = "resume"

# Refuse to clone a VM that is not running
require_running = true

# Keep finished records this long before `hotclone gc` removes them (0 = forever)
retention_secs = 604800

# "always" = fsync every record write, "cache" = rename only (tests, scratch)
durability = "always"

[progress]
# Persist copy progress every N bytes or every T milliseconds
checkpoint_bytes = 268435456
checkpoint_interval_ms = 5000

[copy]
chunk_size = 1048576
# Skip writing all-zero chunks, like cp --sparse=auto
sparse = true

[hypervisor]
# uri = "qemu:///system"
# Overlay directory; overlays are placed beside the base image when unset
# workdir = "/var/lib/hotclone/overlays"
quiesce = false
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, CloneError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CloneError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: HotcloneConfig = toml::from_str(&content).map_err(|e| {
            CloneError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise the defaults
    pub fn load_or_default(path: &Path) -> Result<Self, CloneError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<(), CloneError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CloneError::Config(format!(
                        "Failed to create config directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CloneError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
