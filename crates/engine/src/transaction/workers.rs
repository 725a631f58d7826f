//! Bounded per-disk worker pool

use hotclone_core::DiskId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::warn;

/// Run `work` once for every disk on at most `max_workers` threads
///
/// The calling thread is one of the workers. Returns when every disk has
/// been processed. If a worker thread cannot be spawned the remaining
/// workers (at least the caller) drain the queue.
pub(crate) fn for_each_disk<F>(disks: &[DiskId], max_workers: usize, work: F)
where
    F: Fn(&DiskId) + Sync,
{
    if disks.is_empty() {
        return;
    }
    let next = AtomicUsize::new(0);
    let drain = || loop {
        let i = next.fetch_add(1, Ordering::Relaxed);
        match disks.get(i) {
            Some(disk) => work(disk),
            None => break,
        }
    };

    let workers = max_workers.clamp(1, disks.len());
    thread::scope(|scope| {
        for i in 1..workers {
            let spawned = thread::Builder::new()
                .name(format!("hotclone-disk-{}", i))
                .spawn_scoped(scope, drain);
            if let Err(e) = spawned {
                warn!(target: "hotclone::txn", error = %e, "Failed to spawn disk worker");
                break;
            }
        }
        drain();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    fn disks(n: usize) -> Vec<DiskId> {
        (0..n).map(|i| DiskId::new(format!("d{}", i))).collect()
    }

    #[test]
    fn test_every_disk_processed_once() {
        let seen = Mutex::new(Vec::new());
        let list = disks(10);
        for_each_disk(&list, 3, |d| seen.lock().push(d.clone()));
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 10);
        let unique: BTreeSet<_> = seen.into_iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        for_each_disk(&disks(8), 2, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_workers_still_runs() {
        let count = AtomicUsize::new(0);
        for_each_disk(&disks(3), 0, |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_is_noop() {
        for_each_disk(&[], 4, |_| panic!("no disks"));
    }
}
