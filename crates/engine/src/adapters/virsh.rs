//! libvirt adapter driven through the `virsh` command line
//!
//! Snapshots are external, disk-only and created with `--no-metadata`:
//! libvirt keeps no snapshot object, so the overlay file itself is the
//! snapshot. Its file stem is the deterministic snapshot name, which is how
//! [`HypervisorClient::list_snapshots`] finds snapshots after a crash.
//!
//! Merging is an active block commit with pivot, which folds the overlay
//! back into the base image and repoints the disk at the base.

use crate::config::HypervisorConfig;
use hotclone_core::{
    DiskId, DiskInfo, DiskKind, HypervisorClient, HypervisorError, SnapshotHandle, SnapshotName,
    Timestamp, TxnId, VmId, VmInfo,
};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Hypervisor client backed by `virsh` and `virt-clone`
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    uri: Option<String>,
    workdir: Option<PathBuf>,
    quiesce: bool,
    virsh: PathBuf,
    virt_clone: PathBuf,
}

impl VirshHypervisor {
    /// Adapter for the configured connection
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            workdir: config.workdir.clone(),
            quiesce: config.quiesce,
            virsh: PathBuf::from("virsh"),
            virt_clone: PathBuf::from("virt-clone"),
        }
    }

    /// Use a specific `virsh` binary
    pub fn with_virsh(mut self, path: impl Into<PathBuf>) -> Self {
        self.virsh = path.into();
        self
    }

    fn run_virsh<I, S>(&self, args: I) -> Result<String, HypervisorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv: Vec<OsString> = Vec::new();
        if let Some(uri) = &self.uri {
            argv.push("-c".into());
            argv.push(uri.into());
        }
        argv.extend(args.into_iter().map(Into::into));
        run(&self.virsh, &argv)
    }

    fn domain_xml(&self, vm: &VmId) -> Result<Vec<XmlDisk>, HypervisorError> {
        let xml = self.run_virsh(["dumpxml", vm.as_str()])?;
        Ok(parse_disks(&xml))
    }

    fn is_running(&self, vm: &VmId) -> Result<bool, HypervisorError> {
        let state = self.run_virsh(["domstate", vm.as_str()])?;
        Ok(state.trim() == "running")
    }

    fn overlay_path(&self, base: &Path, name: &str) -> PathBuf {
        let dir = match &self.workdir {
            Some(dir) => dir.clone(),
            None => base.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        dir.join(format!("{}.qcow2", name))
    }
}

fn run(program: &Path, args: &[OsString]) -> Result<String, HypervisorError> {
    debug!(
        target: "hotclone::virsh",
        command = %format!("{} {}", program.display(), args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")),
        "Running command"
    );
    let output = Command::new(program).args(args).output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            HypervisorError::Unavailable(format!("{} is not installed", program.display()))
        } else {
            HypervisorError::Failed(format!("failed to run {}: {}", program.display(), e))
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(classify_failure(&stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Map `virsh` stderr to the hypervisor error taxonomy
fn classify_failure(stderr: &str) -> HypervisorError {
    let lower = stderr.to_lowercase();
    if lower.contains("failed to get domain") || lower.contains("domain not found") {
        HypervisorError::NotFound(stderr.to_string())
    } else if lower.contains("failed to connect") || lower.contains("no connection driver") {
        HypervisorError::Unavailable(stderr.to_string())
    } else {
        HypervisorError::Failed(stderr.to_string())
    }
}

impl HypervisorClient for VirshHypervisor {
    fn describe_vm(&self, vm: &VmId) -> Result<Option<VmInfo>, HypervisorError> {
        match self.is_running(vm) {
            Ok(running) => Ok(Some(VmInfo {
                id: vm.clone(),
                running,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_disk_paths(&self, vm: &VmId) -> Result<BTreeMap<DiskId, DiskInfo>, HypervisorError> {
        Ok(self
            .domain_xml(vm)?
            .into_iter()
            .filter_map(|d| {
                let info = d.info()?;
                Some((DiskId::new(d.target), info))
            })
            .collect())
    }

    fn create_snapshot(
        &self,
        txn_id: TxnId,
        vm: &VmId,
        disk: &DiskId,
        name: &str,
    ) -> Result<SnapshotHandle, HypervisorError> {
        let disks = self.domain_xml(vm)?;
        let target = disks
            .iter()
            .find(|d| d.target == disk.as_str())
            .ok_or_else(|| HypervisorError::NotFound(format!("disk {} of {}", disk, vm)))?;
        let base = target
            .source
            .clone()
            .ok_or_else(|| HypervisorError::Failed(format!("disk {} has no source", disk)))?;
        let overlay = self.overlay_path(&base, name);

        let mut args: Vec<OsString> = vec![
            "snapshot-create-as".into(),
            vm.as_str().into(),
            name.into(),
            "--disk-only".into(),
            "--atomic".into(),
            "--no-metadata".into(),
        ];
        for d in disks.iter().filter(|d| d.device == "disk") {
            args.push("--diskspec".into());
            if d.target == disk.as_str() {
                args.push(format!("{},snapshot=external,file={}", d.target, overlay.display()).into());
            } else {
                args.push(format!("{},snapshot=no", d.target).into());
            }
        }
        if self.quiesce {
            args.push("--quiesce".into());
        }
        self.run_virsh(args)?;

        info!(
            target: "hotclone::virsh",
            vm = %vm,
            disk = %disk,
            snapshot = %name,
            overlay = %overlay.display(),
            "External snapshot created"
        );
        Ok(SnapshotHandle {
            txn_id,
            vm_id: vm.clone(),
            disk_id: disk.clone(),
            name: name.to_string(),
            base_path: base,
            overlay_path: Some(overlay),
            created_at: Timestamp::now(),
        })
    }

    fn merge_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError> {
        let disks = self.domain_xml(&handle.vm_id)?;
        let active = disks
            .iter()
            .find(|d| d.target == handle.disk_id.as_str())
            .and_then(|d| d.source.as_ref());
        let is_ours = match (active, &handle.overlay_path) {
            (Some(active), Some(overlay)) => active == overlay,
            (Some(active), None) => stem(active).as_deref() == Some(handle.name.as_str()),
            (None, _) => false,
        };
        if !is_ours {
            return Err(HypervisorError::NotFound(format!(
                "snapshot {} is no longer active on {}",
                handle.name, handle.disk_id
            )));
        }
        if !self.is_running(&handle.vm_id)? {
            return Err(HypervisorError::Failed(format!(
                "cannot merge {} while {} is not running",
                handle.name, handle.vm_id
            )));
        }

        self.run_virsh([
            "blockcommit",
            handle.vm_id.as_str(),
            handle.disk_id.as_str(),
            "--active",
            "--pivot",
            "--shallow",
            "--wait",
        ])?;
        info!(
            target: "hotclone::virsh",
            vm = %handle.vm_id,
            disk = %handle.disk_id,
            snapshot = %handle.name,
            "Snapshot merged"
        );
        Ok(())
    }

    fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError> {
        let overlay = handle
            .overlay_path
            .clone()
            .unwrap_or_else(|| self.overlay_path(&handle.base_path, &handle.name));

        let disks = self.domain_xml(&handle.vm_id)?;
        if disks.iter().any(|d| d.source.as_deref() == Some(overlay.as_path())) {
            return Err(HypervisorError::Failed(format!(
                "snapshot {} is still active; merge it first",
                handle.name
            )));
        }

        match fs::remove_file(&overlay) {
            Ok(()) => {
                debug!(target: "hotclone::virsh", overlay = %overlay.display(), "Overlay removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(HypervisorError::NotFound(
                format!("overlay {}", overlay.display()),
            )),
            Err(e) => Err(HypervisorError::Failed(format!(
                "failed to remove overlay {}: {}",
                overlay.display(),
                e
            ))),
        }
    }

    fn list_snapshots(&self, vm: &VmId) -> Result<Vec<SnapshotHandle>, HypervisorError> {
        let mut handles = Vec::new();
        for d in self.domain_xml(vm)? {
            let Some(source) = &d.source else { continue };
            let Some(name) = stem(source) else { continue };
            let Some((txn_id, disk_id)) = SnapshotName::parse(&name) else {
                continue;
            };
            if disk_id.as_str() != d.target {
                warn!(
                    target: "hotclone::virsh",
                    vm = %vm,
                    target_dev = %d.target,
                    snapshot = %name,
                    "Overlay name does not match its disk"
                );
            }
            let created_at = fs::metadata(source)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|age| Timestamp::from_micros(age.as_micros() as u64))
                .unwrap_or_else(Timestamp::now);
            handles.push(SnapshotHandle {
                txn_id,
                vm_id: vm.clone(),
                disk_id,
                name,
                base_path: d.backing.clone().unwrap_or_default(),
                overlay_path: Some(source.clone()),
                created_at,
            });
        }
        Ok(handles)
    }

    fn define_vm(
        &self,
        template: &VmId,
        name: &str,
        disks: &BTreeMap<DiskId, PathBuf>,
    ) -> Result<VmId, HypervisorError> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(uri) = &self.uri {
            args.push("--connect".into());
            args.push(uri.into());
        }
        args.extend(
            ["--original", template.as_str(), "--name", name, "--preserve-data"]
                .into_iter()
                .map(OsString::from),
        );
        // virt-clone assigns --file arguments to the template's disks in order
        for path in disks.values() {
            args.push("--file".into());
            args.push(path.into());
        }
        run(&self.virt_clone, &args)?;
        info!(
            target: "hotclone::virsh",
            template = %template,
            vm = %name,
            disks = disks.len(),
            "Destination VM defined"
        );
        Ok(VmId::new(name))
    }
}

fn stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

/// One `<disk>` element of a domain definition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct XmlDisk {
    kind: String,
    device: String,
    target: String,
    driver_name: Option<String>,
    driver_type: Option<String>,
    source: Option<PathBuf>,
    backing: Option<PathBuf>,
    readonly: bool,
    shareable: bool,
    transient: bool,
}

impl XmlDisk {
    fn info(&self) -> Option<DiskInfo> {
        let kind = match self.kind.as_str() {
            "file" => DiskKind::File,
            "block" => DiskKind::Block,
            _ => return None,
        };
        let path = self.source.clone()?;
        let eligible = self.device == "disk"
            && self.driver_name.as_deref().map_or(true, |n| n == "qemu")
            && matches!(self.driver_type.as_deref(), None | Some("raw") | Some("qcow2"))
            && !self.readonly
            && !self.shareable
            && !self.transient;
        Some(DiskInfo {
            path,
            kind,
            eligible,
        })
    }
}

/// Extract the disks of a `virsh dumpxml` document
///
/// Only the handful of attributes the adapter needs are read; this is not a
/// general XML parser.
fn parse_disks(xml: &str) -> Vec<XmlDisk> {
    let mut disks = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<disk ") {
        let body = &rest[start..];
        let end = body.find("</disk>").map_or(body.len(), |e| e + "</disk>".len());
        let chunk = &body[..end];
        rest = &body[end..];

        let (own, backing) = match chunk.find("<backingStore") {
            Some(i) => (&chunk[..i], Some(&chunk[i..])),
            None => (chunk, None),
        };
        let open = tag(chunk, "<disk ").unwrap_or_default();
        let driver = tag(own, "<driver ");
        let mut disk = XmlDisk {
            kind: attr(open, "type").unwrap_or_default(),
            device: attr(open, "device").unwrap_or_else(|| "disk".to_string()),
            target: tag(chunk, "<target ").and_then(|t| attr(t, "dev")).unwrap_or_default(),
            driver_name: driver.and_then(|t| attr(t, "name")),
            driver_type: driver.and_then(|t| attr(t, "type")),
            source: tag(own, "<source ").and_then(source_path),
            backing: backing.and_then(|b| tag(b, "<source ")).and_then(source_path),
            readonly: chunk.contains("<readonly/>"),
            shareable: chunk.contains("<shareable/>"),
            transient: chunk.contains("<transient"),
        };
        if disk.target.is_empty() {
            continue;
        }
        if disk.backing.as_ref().is_some_and(|b| b.as_os_str().is_empty()) {
            disk.backing = None;
        }
        disks.push(disk);
    }
    disks
}

/// Text of the first tag starting with `prefix`, up to its closing `>`
fn tag<'x>(xml: &'x str, prefix: &str) -> Option<&'x str> {
    let start = xml.find(prefix)?;
    let len = xml[start..].find('>')?;
    Some(&xml[start..start + len])
}

fn attr(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!(" {}={}", name, quote);
        if let Some(i) = tag.find(&needle) {
            let value = &tag[i + needle.len()..];
            let end = value.find(quote)?;
            return Some(value[..end].to_string());
        }
    }
    None
}

fn source_path(tag: &str) -> Option<PathBuf> {
    attr(tag, "file").or_else(|| attr(tag, "dev")).map(PathBuf::from)
}
