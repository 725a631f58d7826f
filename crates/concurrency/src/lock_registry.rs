//! Per-(VM, disk) admission locks and destination reservations
//!
//! Two live transactions must never snapshot the same disk: the hypervisor
//! cannot stack temporary snapshots safely. Nor may they target the same
//! destination VM name or write the same destination image. The registry is
//! an explicit object owned by the clone manager (never ambient global
//! state).
//!
//! ## Semantics
//!
//! - Acquisition is all-or-nothing: either every requested key is locked for
//!   the transaction, or none is and the first contended key is reported.
//! - Locks are released when the returned [`DiskLockGuard`] is dropped, which
//!   ties them to the lifetime of the transaction that owns the guard.
//! - The registry is advisory and in-process only.

use hotclone_core::{CloneError, DiskId, TxnId, VmId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Disk(VmId, DiskId),
    Destination(VmId),
    Image(PathBuf),
}

impl LockKey {
    fn conflict(&self, holder: TxnId) -> CloneError {
        match self {
            LockKey::Disk(vm, disk) => CloneError::Conflict {
                vm: vm.clone(),
                disk: disk.clone(),
                holder,
            },
            LockKey::Destination(vm) => CloneError::DestinationReserved {
                target: format!("VM {}", vm),
                holder,
            },
            LockKey::Image(path) => CloneError::DestinationReserved {
                target: format!("image {}", path.display()),
                holder,
            },
        }
    }
}

/// What one clone transaction holds exclusively
#[derive(Debug, Clone, Copy)]
pub struct CloneClaim<'a> {
    /// Source VM
    pub vm: &'a VmId,
    /// Source disks being snapshotted
    pub disks: &'a [DiskId],
    /// Destination VM name
    pub destination: &'a VmId,
    /// Destination images
    pub images: &'a [PathBuf],
}

/// Process-wide table of disks and destinations owned by live transactions
#[derive(Default)]
pub struct DiskLockRegistry {
    held: Mutex<FxHashMap<LockKey, TxnId>>,
}

impl DiskLockRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock every `(vm, disk)` pair for `txn_id`
    ///
    /// # Errors
    /// `CloneError::Conflict` naming the first disk already held by another
    /// transaction. Nothing is locked in that case.
    pub fn acquire(
        self: &Arc<Self>,
        txn_id: TxnId,
        vm: &VmId,
        disks: &[DiskId],
    ) -> Result<DiskLockGuard, CloneError> {
        let keys = disks
            .iter()
            .map(|disk| LockKey::Disk(vm.clone(), disk.clone()))
            .collect();
        self.acquire_keys(txn_id, keys)
    }

    /// Lock the source disks and reserve the destination name and images
    ///
    /// # Errors
    /// `CloneError::Conflict` for a held disk, `CloneError::DestinationReserved`
    /// for a reserved destination name or image. Nothing is locked in either
    /// case.
    pub fn acquire_clone(
        self: &Arc<Self>,
        txn_id: TxnId,
        claim: CloneClaim<'_>,
    ) -> Result<DiskLockGuard, CloneError> {
        let mut keys: Vec<LockKey> = claim
            .disks
            .iter()
            .map(|disk| LockKey::Disk(claim.vm.clone(), disk.clone()))
            .collect();
        keys.push(LockKey::Destination(claim.destination.clone()));
        keys.extend(claim.images.iter().cloned().map(LockKey::Image));
        self.acquire_keys(txn_id, keys)
    }

    fn acquire_keys(
        self: &Arc<Self>,
        txn_id: TxnId,
        requested: Vec<LockKey>,
    ) -> Result<DiskLockGuard, CloneError> {
        let mut held = self.held.lock();

        for key in &requested {
            if let Some(holder) = held.get(key) {
                if *holder != txn_id {
                    debug!(
                        target: "hotclone::lock",
                        key = ?key,
                        holder = %holder,
                        requester = %txn_id,
                        "Lock contended"
                    );
                    return Err(key.conflict(*holder));
                }
            }
        }

        let mut keys = Vec::with_capacity(requested.len());
        for key in requested {
            if held.insert(key.clone(), txn_id).is_none() {
                keys.push(key);
            }
        }

        debug!(target: "hotclone::lock", txn_id = %txn_id, keys = keys.len(), "Locks acquired");

        Ok(DiskLockGuard {
            registry: Arc::clone(self),
            txn_id,
            keys,
        })
    }

    /// Transaction currently holding a disk
    pub fn holder(&self, vm: &VmId, disk: &DiskId) -> Option<TxnId> {
        self.held
            .lock()
            .get(&LockKey::Disk(vm.clone(), disk.clone()))
            .copied()
    }

    /// Transaction currently reserving a destination VM name
    pub fn destination_holder(&self, destination: &VmId) -> Option<TxnId> {
        self.held
            .lock()
            .get(&LockKey::Destination(destination.clone()))
            .copied()
    }

    /// Transaction currently reserving a destination image
    pub fn image_holder(&self, image: &Path) -> Option<TxnId> {
        self.held
            .lock()
            .get(&LockKey::Image(image.to_path_buf()))
            .copied()
    }

    /// Number of held locks and reservations
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// True if nothing is held
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    fn release(&self, txn_id: TxnId, keys: &[LockKey]) {
        let mut held = self.held.lock();
        for key in keys {
            if held.get(key) == Some(&txn_id) {
                held.remove(key);
            }
        }
    }
}

/// Scoped ownership of a set of locks
///
/// Dropping the guard releases the locks.
pub struct DiskLockGuard {
    registry: Arc<DiskLockRegistry>,
    txn_id: TxnId,
    keys: Vec<LockKey>,
}

impl DiskLockGuard {
    /// Transaction owning the locks
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Number of locks held by this guard
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the guard holds nothing
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for DiskLockGuard {
    fn drop(&mut self) {
        self.registry.release(self.txn_id, &self.keys);
        debug!(target: "hotclone::lock", txn_id = %self.txn_id, "Locks released");
    }
}

impl std::fmt::Debug for DiskLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLockGuard")
            .field("txn_id", &self.txn_id)
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disks(names: &[&str]) -> Vec<DiskId> {
        names.iter().map(|n| DiskId::from(*n)).collect()
    }

    #[test]
    fn test_acquire_and_release() {
        let registry = DiskLockRegistry::new();
        let vm = VmId::from("v1");
        let txn = TxnId::new();

        let guard = registry.acquire(txn, &vm, &disks(&["d0", "d1"])).unwrap();
        assert_eq!(guard.len(), 2);
        assert_eq!(registry.holder(&vm, &DiskId::from("d0")), Some(txn));

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_conflict_on_shared_disk() {
        let registry = DiskLockRegistry::new();
        let vm = VmId::from("v1");
        let first = TxnId::new();
        let _guard = registry.acquire(first, &vm, &disks(&["d0"])).unwrap();

        let err = registry
            .acquire(TxnId::new(), &vm, &disks(&["d1", "d0"]))
            .unwrap_err();
        match err {
            CloneError::Conflict { disk, holder, .. } => {
                assert_eq!(disk, DiskId::from("d0"));
                assert_eq!(holder, first);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // all-or-nothing: d1 was not taken
        assert_eq!(registry.holder(&vm, &DiskId::from("d1")), None);
    }

    #[test]
    fn test_same_disk_on_different_vms() {
        let registry = DiskLockRegistry::new();
        let _a = registry
            .acquire(TxnId::new(), &VmId::from("v1"), &disks(&["vda"]))
            .unwrap();
        let _b = registry
            .acquire(TxnId::new(), &VmId::from("v2"), &disks(&["vda"]))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reacquire_by_same_txn_is_not_a_conflict() {
        let registry = DiskLockRegistry::new();
        let vm = VmId::from("v1");
        let txn = TxnId::new();
        let outer = registry.acquire(txn, &vm, &disks(&["d0"])).unwrap();
        let inner = registry.acquire(txn, &vm, &disks(&["d0"])).unwrap();
        assert!(inner.is_empty());
        drop(inner);
        assert_eq!(registry.holder(&vm, &DiskId::from("d0")), Some(txn));
        drop(outer);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destination_name_is_reserved() {
        let registry = DiskLockRegistry::new();
        let first = TxnId::new();
        let destination = VmId::from("web-clone");
        let _guard = registry
            .acquire_clone(
                first,
                CloneClaim {
                    vm: &VmId::from("v1"),
                    disks: &disks(&["d0"]),
                    destination: &destination,
                    images: &[PathBuf::from("/images/a.img")],
                },
            )
            .unwrap();
        assert_eq!(registry.destination_holder(&destination), Some(first));

        let err = registry
            .acquire_clone(
                TxnId::new(),
                CloneClaim {
                    vm: &VmId::from("v2"),
                    disks: &disks(&["d0"]),
                    destination: &destination,
                    images: &[PathBuf::from("/images/b.img")],
                },
            )
            .unwrap_err();
        match err {
            CloneError::DestinationReserved { target, holder } => {
                assert_eq!(target, "VM web-clone");
                assert_eq!(holder, first);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(registry.holder(&VmId::from("v2"), &DiskId::from("d0")), None);
    }

    #[test]
    fn test_destination_image_is_reserved() {
        let registry = DiskLockRegistry::new();
        let image = PathBuf::from("/images/shared.img");
        let first = TxnId::new();
        let guard = registry
            .acquire_clone(
                first,
                CloneClaim {
                    vm: &VmId::from("v1"),
                    disks: &disks(&["d0"]),
                    destination: &VmId::from("a"),
                    images: std::slice::from_ref(&image),
                },
            )
            .unwrap();
        assert_eq!(guard.len(), 3);

        let err = registry
            .acquire_clone(
                TxnId::new(),
                CloneClaim {
                    vm: &VmId::from("v2"),
                    disks: &disks(&["d0"]),
                    destination: &VmId::from("b"),
                    images: std::slice::from_ref(&image),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CloneError::DestinationReserved { holder, .. } if holder == first));

        drop(guard);
        assert_eq!(registry.image_holder(&image), None);
        assert!(registry.is_empty());
    }
}
