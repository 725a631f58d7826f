//! Request validation and destination planning
//!
//! Everything here is read-only against the hypervisor: a rejected request
//! leaves no record and no snapshot behind.

use crate::config::HotcloneConfig;
use hotclone_core::{
    CloneError, CloneRequest, DiskId, DiskInfo, DiskKind, DiskRecord, DiskSelection,
    HypervisorClient, TransactionRecord, TxnId, VmId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A validated request with every destination path resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonePlan {
    /// The request as admitted
    pub request: CloneRequest,
    /// Fresh per-disk records, keyed by disk id
    pub disks: BTreeMap<DiskId, DiskRecord>,
}

impl ClonePlan {
    /// Source VM
    pub fn source(&self) -> &VmId {
        &self.request.source
    }

    /// Disks to clone, in order
    pub fn disk_ids(&self) -> Vec<DiskId> {
        self.disks.keys().cloned().collect()
    }

    /// Turn the plan into a `Pending` record
    pub fn into_record(self, txn_id: TxnId) -> TransactionRecord {
        TransactionRecord::new(txn_id, self.request, self.disks)
    }
}

/// Validate `request` against the hypervisor and resolve destinations
///
/// # Errors
///
/// `CloneError::Validation` if the request is malformed, the source VM is
/// missing (or stopped while `require_running` is set), the destination VM
/// already exists, a selected disk is unknown or ineligible, or a
/// destination path exists, repeats, or points at a source image.
/// Hypervisor failures are returned as `CloneError::Hypervisor` on disk `*`.
pub fn plan_clone(
    hypervisor: &dyn HypervisorClient,
    config: &HotcloneConfig,
    request: &CloneRequest,
) -> Result<ClonePlan, CloneError> {
    request.validate_shape()?;
    let vm_level = DiskId::from("*");

    let source = hypervisor
        .describe_vm(&request.source)
        .map_err(|e| CloneError::hypervisor(&vm_level, e))?
        .ok_or_else(|| {
            CloneError::Validation(format!("source VM '{}' does not exist", request.source))
        })?;
    if config.require_running && !source.running {
        return Err(CloneError::Validation(format!(
            "source VM '{}' is not running",
            request.source
        )));
    }

    let destination = VmId::new(request.destination.clone());
    if hypervisor
        .describe_vm(&destination)
        .map_err(|e| CloneError::hypervisor(&vm_level, e))?
        .is_some()
    {
        return Err(CloneError::Validation(format!(
            "destination VM '{}' already exists",
            destination
        )));
    }

    let topology = hypervisor
        .get_disk_paths(&request.source)
        .map_err(|e| CloneError::hypervisor(&vm_level, e))?;
    let selected = select_disks(request, &topology)?;

    let source_paths: BTreeSet<&Path> = topology.values().map(|d| d.path.as_path()).collect();
    let mut seen = BTreeSet::new();
    let mut disks = BTreeMap::new();
    for (disk, info) in selected {
        let dest = match request.destinations.get(&disk) {
            Some(path) => path.clone(),
            None => default_destination(&config.dest_dir, &request.destination, &disk, info),
        };
        if source_paths.contains(dest.as_path()) {
            return Err(CloneError::Validation(format!(
                "destination {} of disk {} is a source image",
                dest.display(),
                disk
            )));
        }
        if dest.exists() {
            return Err(CloneError::Validation(format!(
                "destination {} of disk {} already exists",
                dest.display(),
                disk
            )));
        }
        if !seen.insert(dest.clone()) {
            return Err(CloneError::Validation(format!(
                "destination {} is used by more than one disk",
                dest.display()
            )));
        }
        disks.insert(disk, DiskRecord::new(info.path.clone(), dest));
    }

    Ok(ClonePlan {
        request: request.clone(),
        disks,
    })
}

fn select_disks<'t>(
    request: &CloneRequest,
    topology: &'t BTreeMap<DiskId, DiskInfo>,
) -> Result<Vec<(DiskId, &'t DiskInfo)>, CloneError> {
    match &request.disks {
        DiskSelection::All => {
            let eligible: Vec<_> = topology
                .iter()
                .filter(|(_, info)| info.eligible)
                .map(|(id, info)| (id.clone(), info))
                .collect();
            if eligible.is_empty() {
                return Err(CloneError::Validation(format!(
                    "source VM '{}' has no disk eligible for cloning",
                    request.source
                )));
            }
            Ok(eligible)
        }
        DiskSelection::Only(ids) => ids
            .iter()
            .map(|id| match topology.get(id) {
                None => Err(CloneError::Validation(format!(
                    "source VM '{}' has no disk '{}'",
                    request.source, id
                ))),
                Some(info) if !info.eligible => Err(CloneError::Validation(format!(
                    "disk '{}' cannot be snapshotted (readonly, shareable, transient, or not a disk image)",
                    id
                ))),
                Some(info) => Ok((id.clone(), info)),
            })
            .collect(),
    }
}

/// `<dest_dir>/<destination>-<disk>.<ext>`, keeping the source extension
fn default_destination(dest_dir: &Path, destination: &str, disk: &DiskId, info: &DiskInfo) -> PathBuf {
    let ext = match info.kind {
        DiskKind::Block => "img".to_string(),
        DiskKind::File => info
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "img".to_string()),
    };
    dest_dir.join(format!("{}-{}.{}", destination, disk, ext))
}
