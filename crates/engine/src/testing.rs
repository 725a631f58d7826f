//! In-process collaborators for tests
//!
//! [`FakeHypervisor`] keeps base images as real files and models a
//! snapshot's overlay in memory: guest writes made while a snapshot is
//! active land in the overlay and the base file stays frozen until merge.
//! [`ScriptedCopier`] wraps [`FileBlockCopier`] with fault injection.

use crate::adapters::FileBlockCopier;
use hotclone_core::{
    AbortSignal, BlockCopier, CopyError, CopyProgress, DiskId, DiskInfo, DiskKind,
    HypervisorClient, HypervisorError, SnapshotHandle, Timestamp, TxnId, VmId, VmInfo,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Hypervisor operation selector for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `describe_vm`
    DescribeVm,
    /// `get_disk_paths`
    GetDiskPaths,
    /// `create_snapshot`
    CreateSnapshot,
    /// `merge_snapshot`
    MergeSnapshot,
    /// `delete_snapshot`
    DeleteSnapshot,
    /// `list_snapshots`
    ListSnapshots,
    /// `define_vm`
    DefineVm,
}

#[derive(Debug)]
struct Fault {
    op: FakeOp,
    disk: Option<DiskId>,
    remaining: Option<u32>,
    /// The call takes effect, only the reply is lost
    lose_reply: bool,
}

#[derive(Debug)]
struct FakeSnapshot {
    handle: SnapshotHandle,
    writes: Vec<(u64, Vec<u8>)>,
    merged: bool,
}

#[derive(Debug)]
struct FakeDisk {
    info: DiskInfo,
    snapshot: Option<FakeSnapshot>,
}

#[derive(Debug)]
struct FakeVm {
    running: bool,
    disks: BTreeMap<DiskId, FakeDisk>,
}

#[derive(Debug, Default)]
struct FakeState {
    vms: BTreeMap<VmId, FakeVm>,
    faults: Vec<Fault>,
    calls: FxHashMap<FakeOp, usize>,
}

impl FakeState {
    /// Consume a matching fault, if any
    fn take_fault(&mut self, op: FakeOp, disk: Option<&DiskId>) -> Option<bool> {
        let i = self.faults.iter().position(|f| {
            f.op == op && f.remaining != Some(0) && (f.disk.is_none() || f.disk.as_ref() == disk)
        })?;
        let fault = &mut self.faults[i];
        if let Some(n) = &mut fault.remaining {
            *n -= 1;
        }
        Some(fault.lose_reply)
    }

    fn vm(&self, vm: &VmId) -> Result<&FakeVm, HypervisorError> {
        self.vms
            .get(vm)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain {}", vm)))
    }

    fn disk_mut(&mut self, vm: &VmId, disk: &DiskId) -> Result<&mut FakeDisk, HypervisorError> {
        self.vms
            .get_mut(vm)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain {}", vm)))?
            .disks
            .get_mut(disk)
            .ok_or_else(|| HypervisorError::NotFound(format!("disk {} of {}", disk, vm)))
    }
}

fn injected(op: FakeOp) -> HypervisorError {
    HypervisorError::Failed(format!("injected {:?} failure", op))
}

/// In-memory hypervisor with file-backed base images
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    /// Empty hypervisor
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VM without disks
    pub fn add_vm(&self, vm: &str, running: bool) {
        self.state.lock().vms.insert(
            VmId::from(vm),
            FakeVm {
                running,
                disks: BTreeMap::new(),
            },
        );
    }

    /// Attach an eligible disk whose base image is written with `content`
    pub fn add_disk(&self, vm: &str, disk: &str, path: impl Into<PathBuf>, content: &[u8]) -> io::Result<()> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        self.attach(vm, disk, DiskInfo::file(path));
        Ok(())
    }

    /// Attach a disk that cannot be snapshotted (a cdrom, say)
    pub fn add_ineligible_disk(&self, vm: &str, disk: &str, path: impl Into<PathBuf>) {
        self.attach(
            vm,
            disk,
            DiskInfo {
                path: path.into(),
                kind: DiskKind::File,
                eligible: false,
            },
        );
    }

    fn attach(&self, vm: &str, disk: &str, info: DiskInfo) {
        let mut state = self.state.lock();
        if let Some(fake) = state.vms.get_mut(&VmId::from(vm)) {
            fake.disks.insert(DiskId::from(disk), FakeDisk { info, snapshot: None });
        }
    }

    /// Guest write: lands in the overlay while a snapshot is active
    pub fn guest_write(&self, vm: &str, disk: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let fake = state
            .disk_mut(&VmId::from(vm), &DiskId::from(disk))
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        match &mut fake.snapshot {
            Some(snap) if !snap.merged => {
                snap.writes.push((offset, data.to_vec()));
                Ok(())
            }
            _ => write_at(&fake.info.path, offset, data),
        }
    }

    /// Disk content as the guest sees it (base plus overlay)
    pub fn read_guest(&self, vm: &str, disk: &str) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        let fake = state
            .disk_mut(&VmId::from(vm), &DiskId::from(disk))
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        let mut content = fs::read(&fake.info.path)?;
        if let Some(snap) = &fake.snapshot {
            if !snap.merged {
                for (offset, data) in &snap.writes {
                    apply(&mut content, *offset, data);
                }
            }
        }
        Ok(content)
    }

    /// Fail the next call of `op` (on `disk`, if given)
    pub fn fail_once(&self, op: FakeOp, disk: Option<&str>) {
        self.push_fault(op, disk, Some(1), false);
    }

    /// Fail every call of `op` (on `disk`, if given)
    pub fn fail_always(&self, op: FakeOp, disk: Option<&str>) {
        self.push_fault(op, disk, None, false);
    }

    /// Let the next `create_snapshot` on `disk` succeed but report failure
    pub fn lose_create_reply(&self, disk: &str) {
        self.push_fault(FakeOp::CreateSnapshot, Some(disk), Some(1), true);
    }

    /// Drop every injected fault
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn push_fault(&self, op: FakeOp, disk: Option<&str>, remaining: Option<u32>, lose_reply: bool) {
        self.state.lock().faults.push(Fault {
            op,
            disk: disk.map(DiskId::from),
            remaining,
            lose_reply,
        });
    }

    /// Snapshots currently present on `vm`
    pub fn snapshot_count(&self, vm: &str) -> usize {
        self.state
            .lock()
            .vms
            .get(&VmId::from(vm))
            .map_or(0, |v| v.disks.values().filter(|d| d.snapshot.is_some()).count())
    }

    /// True if `vm` is registered
    pub fn vm_exists(&self, vm: &str) -> bool {
        self.state.lock().vms.contains_key(&VmId::from(vm))
    }

    /// Disk paths of a registered VM
    pub fn vm_disks(&self, vm: &str) -> Option<BTreeMap<DiskId, PathBuf>> {
        self.state.lock().vms.get(&VmId::from(vm)).map(|v| {
            v.disks
                .iter()
                .map(|(id, d)| (id.clone(), d.info.path.clone()))
                .collect()
        })
    }

    /// Number of calls made to `op`
    pub fn calls(&self, op: FakeOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, state: &mut FakeState, op: FakeOp, disk: Option<&DiskId>) -> Result<bool, HypervisorError> {
        *state.calls.entry(op).or_default() += 1;
        match state.take_fault(op, disk) {
            Some(false) => Err(injected(op)),
            Some(true) => Ok(true),
            None => Ok(false),
        }
    }
}

fn apply(content: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let start = offset as usize;
    let end = start + data.len();
    if content.len() < end {
        content.resize(end, 0);
    }
    content[start..end].copy_from_slice(data);
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

impl HypervisorClient for FakeHypervisor {
    fn describe_vm(&self, vm: &VmId) -> Result<Option<VmInfo>, HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::DescribeVm, None)?;
        Ok(state.vms.get(vm).map(|v| VmInfo {
            id: vm.clone(),
            running: v.running,
        }))
    }

    fn get_disk_paths(&self, vm: &VmId) -> Result<BTreeMap<DiskId, DiskInfo>, HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::GetDiskPaths, None)?;
        Ok(state
            .vm(vm)?
            .disks
            .iter()
            .map(|(id, d)| (id.clone(), d.info.clone()))
            .collect())
    }

    fn create_snapshot(
        &self,
        txn_id: TxnId,
        vm: &VmId,
        disk: &DiskId,
        name: &str,
    ) -> Result<SnapshotHandle, HypervisorError> {
        let mut state = self.state.lock();
        let lose_reply = self.enter(&mut state, FakeOp::CreateSnapshot, Some(disk))?;
        let fake = state.disk_mut(vm, disk)?;
        if let Some(existing) = &fake.snapshot {
            return Err(HypervisorError::Failed(format!(
                "disk {} already has snapshot {}",
                disk, existing.handle.name
            )));
        }
        let base = fake.info.path.clone();
        let handle = SnapshotHandle {
            txn_id,
            vm_id: vm.clone(),
            disk_id: disk.clone(),
            name: name.to_string(),
            overlay_path: base.parent().map(|p| p.join(format!("{}.qcow2", name))),
            base_path: base,
            created_at: Timestamp::now(),
        };
        fake.snapshot = Some(FakeSnapshot {
            handle: handle.clone(),
            writes: Vec::new(),
            merged: false,
        });
        if lose_reply {
            return Err(HypervisorError::Unavailable("connection reset".to_string()));
        }
        Ok(handle)
    }

    fn merge_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::MergeSnapshot, Some(&handle.disk_id))?;
        let fake = state.disk_mut(&handle.vm_id, &handle.disk_id)?;
        let path = fake.info.path.clone();
        let snap = match &mut fake.snapshot {
            Some(snap) if snap.handle.name == handle.name => snap,
            _ => return Err(HypervisorError::NotFound(format!("snapshot {}", handle.name))),
        };
        if snap.merged {
            return Ok(());
        }
        for (offset, data) in snap.writes.drain(..) {
            write_at(&path, offset, &data)
                .map_err(|e| HypervisorError::Failed(format!("merge write failed: {}", e)))?;
        }
        snap.merged = true;
        Ok(())
    }

    fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::DeleteSnapshot, Some(&handle.disk_id))?;
        let fake = state.disk_mut(&handle.vm_id, &handle.disk_id)?;
        let merged = match &fake.snapshot {
            Some(snap) if snap.handle.name == handle.name => snap.merged,
            _ => return Err(HypervisorError::NotFound(format!("snapshot {}", handle.name))),
        };
        if !merged {
            return Err(HypervisorError::Failed(format!(
                "snapshot {} is still active; merge it first",
                handle.name
            )));
        }
        fake.snapshot = None;
        Ok(())
    }

    fn list_snapshots(&self, vm: &VmId) -> Result<Vec<SnapshotHandle>, HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::ListSnapshots, None)?;
        Ok(state
            .vm(vm)?
            .disks
            .values()
            .filter_map(|d| d.snapshot.as_ref().map(|s| s.handle.clone()))
            .collect())
    }

    fn define_vm(
        &self,
        template: &VmId,
        name: &str,
        disks: &BTreeMap<DiskId, PathBuf>,
    ) -> Result<VmId, HypervisorError> {
        let mut state = self.state.lock();
        self.enter(&mut state, FakeOp::DefineVm, None)?;
        state.vm(template)?;
        let id = VmId::new(name);
        if state.vms.contains_key(&id) {
            return Err(HypervisorError::Failed(format!("domain {} already exists", id)));
        }
        let disks = disks
            .iter()
            .map(|(disk, path)| {
                (
                    disk.clone(),
                    FakeDisk {
                        info: DiskInfo::file(path.clone()),
                        snapshot: None,
                    },
                )
            })
            .collect();
        state.vms.insert(
            id.clone(),
            FakeVm {
                running: false,
                disks,
            },
        );
        Ok(id)
    }
}

type ChunkHook = Box<dyn Fn(&Path, CopyProgress) + Send + Sync>;

#[derive(Default)]
struct Script {
    fail_sources: Vec<PathBuf>,
    block_until_cancelled: bool,
    on_chunk: Option<ChunkHook>,
}

/// File copier with scripted failures
pub struct ScriptedCopier {
    inner: FileBlockCopier,
    script: Mutex<Script>,
    copies: Mutex<usize>,
}

impl ScriptedCopier {
    /// Wrap a copier with small chunks so hooks fire often
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: FileBlockCopier::default().with_chunk_size(chunk_size),
            script: Mutex::new(Script::default()),
            copies: Mutex::new(0),
        }
    }

    /// Copies of `source` write a partial destination and then fail
    pub fn fail_copy_of(&self, source: impl Into<PathBuf>) {
        self.script.lock().fail_sources.push(source.into());
    }

    /// Every copy waits for the abort signal and reports `Cancelled`
    pub fn block_until_cancelled(&self) {
        self.script.lock().block_until_cancelled = true;
    }

    /// Call `hook` after every copied chunk
    pub fn on_chunk(&self, hook: impl Fn(&Path, CopyProgress) + Send + Sync + 'static) {
        self.script.lock().on_chunk = Some(Box::new(hook));
    }

    /// Number of copies started
    pub fn copies(&self) -> usize {
        *self.copies.lock()
    }
}

impl BlockCopier for ScriptedCopier {
    fn copy(
        &self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
        abort: &dyn AbortSignal,
    ) -> Result<u64, CopyError> {
        *self.copies.lock() += 1;
        let (fail, block) = {
            let script = self.script.lock();
            (
                script.fail_sources.iter().any(|s| s == source),
                script.block_until_cancelled,
            )
        };

        if fail {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, b"partial")?;
            return Err(CopyError::Failed(format!(
                "injected failure copying {}",
                source.display()
            )));
        }

        if block {
            let deadline = Instant::now() + Duration::from_secs(30);
            while !abort.is_aborted() {
                if Instant::now() > deadline {
                    return Err(CopyError::Failed("never cancelled".to_string()));
                }
                thread::sleep(Duration::from_millis(1));
            }
            return Err(CopyError::Cancelled);
        }

        let script = &self.script;
        self.inner.copy(
            source,
            dest,
            &mut |p| {
                on_progress(p);
                if let Some(hook) = &script.lock().on_chunk {
                    hook(source, p);
                }
            },
            abort,
        )
    }

    fn discard(&self, dest: &Path) -> Result<(), CopyError> {
        self.inner.discard(dest)
    }
}
