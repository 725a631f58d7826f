//! Core identifiers and request types
//!
//! - [`TxnId`]: unique identifier of one clone transaction (UUID v4)
//! - [`VmId`] / [`DiskId`]: hypervisor-assigned names
//! - [`CloneRequest`]: immutable description of what to clone and where
//! - [`SnapshotName`]: the deterministic snapshot naming convention
//! - [`SnapshotHandle`]: one temporary snapshot owned by a transaction

use crate::error::CloneError;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a clone transaction
///
/// A wrapper around a UUID v4. The simple (hyphen-free) form is embedded in
/// snapshot names, which makes it the anchor recovery uses to find snapshots
/// a crashed process created but never recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Create a new random TxnId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TxnId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a TxnId from its string form (with or without hyphens)
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Hyphen-free lowercase hex form (32 characters)
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }

    /// Get the raw bytes of this TxnId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wrap a hypervisor-assigned name
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Borrow the underlying name
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

name_type!(
    /// Virtual machine identifier (libvirt domain name)
    VmId
);

name_type!(
    /// Disk identifier within one VM (target device, e.g. `vda`)
    DiskId
);

/// How a disk is backed on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskKind {
    /// Regular image file
    File,
    /// Host block device
    Block,
}

/// Disk topology entry reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// Path of the image currently backing the disk
    pub path: PathBuf,
    /// File or block backing
    pub kind: DiskKind,
    /// Whether the disk can take part in an external snapshot
    ///
    /// Readonly, shareable and transient disks, cdroms, and non-qemu drivers
    /// are reported as ineligible.
    pub eligible: bool,
}

impl DiskInfo {
    /// Eligible file-backed disk
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DiskInfo {
            path: path.into(),
            kind: DiskKind::File,
            eligible: true,
        }
    }
}

/// Coarse VM description used for validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// VM identifier
    pub id: VmId,
    /// True if the guest is currently running
    pub running: bool,
}

/// Which disks of the source VM to clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSelection {
    /// Every eligible disk
    All,
    /// Exactly these disks
    Only(Vec<DiskId>),
}

/// Immutable clone request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRequest {
    /// VM whose disks are cloned
    pub source: VmId,
    /// Name the destination VM is registered under
    pub destination: String,
    /// Disks to clone
    pub disks: DiskSelection,
    /// Optional destination path per disk (defaults are derived from config)
    #[serde(default)]
    pub destinations: BTreeMap<DiskId, PathBuf>,
}

impl CloneRequest {
    /// Request cloning every eligible disk of `source` into `destination`
    pub fn new(source: impl Into<VmId>, destination: impl Into<String>) -> Self {
        CloneRequest {
            source: source.into(),
            destination: destination.into(),
            disks: DiskSelection::All,
            destinations: BTreeMap::new(),
        }
    }

    /// Restrict the clone to the given disks
    pub fn with_disks<I, D>(mut self, disks: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DiskId>,
    {
        self.disks = DiskSelection::Only(disks.into_iter().map(Into::into).collect());
        self
    }

    /// Place one disk's copy at an explicit path
    pub fn with_destination_path(mut self, disk: impl Into<DiskId>, path: impl Into<PathBuf>) -> Self {
        self.destinations.insert(disk.into(), path.into());
        self
    }

    /// Checks that need no hypervisor round-trip
    ///
    /// # Errors
    /// Returns `CloneError::Validation` for an empty or malformed destination
    /// name, a destination equal to the source, an empty or duplicated disk
    /// selection, or an explicit destination for a disk that is not selected.
    pub fn validate_shape(&self) -> Result<(), CloneError> {
        let dest = self.destination.as_str();
        if dest.is_empty() {
            return Err(CloneError::Validation(
                "destination name must not be empty".to_string(),
            ));
        }
        if dest.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(CloneError::Validation(format!(
                "destination name '{}' contains whitespace or '/'",
                dest
            )));
        }
        if dest == self.source.as_str() {
            return Err(CloneError::Validation(
                "destination name must differ from the source VM".to_string(),
            ));
        }

        if let DiskSelection::Only(disks) = &self.disks {
            if disks.is_empty() {
                return Err(CloneError::Validation(
                    "explicit disk selection is empty".to_string(),
                ));
            }
            let mut seen = BTreeSet::new();
            for disk in disks {
                if !seen.insert(disk) {
                    return Err(CloneError::Validation(format!(
                        "disk '{}' selected more than once",
                        disk
                    )));
                }
            }
            for disk in self.destinations.keys() {
                if !seen.contains(disk) {
                    return Err(CloneError::Validation(format!(
                        "destination path given for unselected disk '{}'",
                        disk
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Deterministic snapshot naming convention
///
/// The name is a pure function of `(TxnId, DiskId)`:
/// `hotclone-<txn simple hex>-<disk>`. Recovery re-derives it from the log
/// alone and uses [`SnapshotName::parse`] to attribute hypervisor snapshots to
/// transactions.
pub struct SnapshotName;

impl SnapshotName {
    /// Prefix shared by every snapshot this crate creates
    pub const PREFIX: &'static str = "hotclone-";

    const TXN_HEX_LEN: usize = 32;

    /// Name of the snapshot for one disk of one transaction
    pub fn for_disk(txn_id: TxnId, disk: &DiskId) -> String {
        format!("{}{}-{}", Self::PREFIX, txn_id.simple(), disk)
    }

    /// Attribute a snapshot name back to its transaction and disk
    ///
    /// Returns `None` for names that do not follow the convention.
    pub fn parse(name: &str) -> Option<(TxnId, DiskId)> {
        let rest = name.strip_prefix(Self::PREFIX)?;
        if rest.len() < Self::TXN_HEX_LEN + 2 || !rest.is_char_boundary(Self::TXN_HEX_LEN) {
            return None;
        }
        let (hex, tail) = rest.split_at(Self::TXN_HEX_LEN);
        let disk = tail.strip_prefix('-')?;
        if disk.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let txn_id = TxnId::from_string(hex)?;
        Some((txn_id, DiskId::new(disk)))
    }
}

/// One temporary snapshot taken during a transaction
///
/// Owned exclusively by the transaction that created it. Released exactly
/// once, on commit (merge) or on rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    /// Owning transaction
    pub txn_id: TxnId,
    /// VM the snapshot was taken on
    pub vm_id: VmId,
    /// Disk the snapshot covers
    pub disk_id: DiskId,
    /// Hypervisor-side name (see [`SnapshotName`])
    pub name: String,
    /// Frozen base image, safe to read while the snapshot is active
    pub base_path: PathBuf,
    /// Overlay receiving guest writes, when the hypervisor exposes it
    #[serde(default)]
    pub overlay_path: Option<PathBuf>,
    /// When the hypervisor confirmed the snapshot
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_unique() {
        assert_ne!(TxnId::new(), TxnId::new());
    }

    #[test]
    fn test_txn_id_string_roundtrip() {
        let id = TxnId::new();
        assert_eq!(TxnId::from_string(&id.to_string()), Some(id));
        assert_eq!(TxnId::from_string(&id.simple()), Some(id));
        assert_eq!(id.simple().len(), 32);
    }

    #[test]
    fn test_snapshot_name_is_deterministic() {
        let id = TxnId::new();
        let disk = DiskId::from("vda");
        assert_eq!(
            SnapshotName::for_disk(id, &disk),
            SnapshotName::for_disk(id, &disk)
        );
    }

    #[test]
    fn test_snapshot_name_parse() {
        let id = TxnId::new();
        let disk = DiskId::from("data-disk-1");
        let name = SnapshotName::for_disk(id, &disk);
        assert_eq!(SnapshotName::parse(&name), Some((id, disk)));
    }

    #[test]
    fn test_snapshot_name_parse_rejects_foreign_names() {
        assert_eq!(SnapshotName::parse("nightly-backup"), None);
        assert_eq!(SnapshotName::parse("hotclone-"), None);
        assert_eq!(SnapshotName::parse("hotclone-zz-vda"), None);
        let id = TxnId::new();
        assert_eq!(SnapshotName::parse(&format!("hotclone-{}-", id.simple())), None);
        assert_eq!(SnapshotName::parse(&format!("hotclone-{}vda", id.simple())), None);
    }

    #[test]
    fn test_validate_shape_accepts_minimal_request() {
        let req = CloneRequest::new("v1", "v1-clone");
        assert!(req.validate_shape().is_ok());
    }

    #[test]
    fn test_validate_shape_rejects_same_name() {
        let req = CloneRequest::new("v1", "v1");
        assert!(matches!(req.validate_shape(), Err(CloneError::Validation(_))));
    }

    #[test]
    fn test_validate_shape_rejects_bad_names() {
        assert!(CloneRequest::new("v1", "").validate_shape().is_err());
        assert!(CloneRequest::new("v1", "a b").validate_shape().is_err());
        assert!(CloneRequest::new("v1", "a/b").validate_shape().is_err());
    }

    #[test]
    fn test_validate_shape_rejects_duplicate_disks() {
        let req = CloneRequest::new("v1", "v2").with_disks(["vda", "vda"]);
        assert!(matches!(req.validate_shape(), Err(CloneError::Validation(_))));
    }

    #[test]
    fn test_validate_shape_rejects_empty_selection() {
        let req = CloneRequest::new("v1", "v2").with_disks(Vec::<DiskId>::new());
        assert!(req.validate_shape().is_err());
    }

    #[test]
    fn test_validate_shape_rejects_destination_for_unselected_disk() {
        let req = CloneRequest::new("v1", "v2")
            .with_disks(["vda"])
            .with_destination_path("vdb", "/tmp/vdb.img");
        assert!(req.validate_shape().is_err());
    }
}
