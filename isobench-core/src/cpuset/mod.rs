//! CPU Set Management
//!
//! Partitions host cores among concurrently running benchmarks. A [`CpuPool`]
//! is the single authoritative record of which core belongs to which set;
//! every reservation and release happens under its lock. Reservations are
//! returned as [`CpuSetHandle`]s that give their cores back when dropped.

mod backend;
#[cfg(target_os = "linux")]
mod cgroup;
mod topology;

#[cfg(target_os = "linux")]
pub use backend::LinuxAffinity;
pub use backend::{BackendKind, ExecBinding, FixedTopology, IsolationBackend};
#[cfg(target_os = "linux")]
pub use cgroup::CgroupCpuset;
pub use topology::{CoreInfo, parse_cpu_list, read_sysfs_topology};

use crate::error::CpuSetError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifier of a reserved core set, unique within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuSetId(pub u64);

impl std::fmt::Display for CpuSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpuset-{}", self.0)
    }
}

/// Snapshot of an active core set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet {
    pub id: CpuSetId,
    pub cores: Vec<usize>,
    /// Processes currently bound to the set
    pub processes: BTreeSet<u32>,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreUsage {
    Free,
    Exclusive(CpuSetId),
    Shared(usize),
}

#[derive(Debug)]
struct PoolState {
    usage: BTreeMap<usize, CoreUsage>,
    sets: BTreeMap<CpuSetId, CpuSet>,
    next_id: u64,
}

/// Session-scoped core bookkeeping
#[derive(Debug)]
pub struct CpuPool {
    cores: Vec<CoreInfo>,
    housekeeping: Option<usize>,
    state: Mutex<PoolState>,
}

impl CpuPool {
    /// Pool over `cores`, optionally keeping one core back for housekeeping
    pub fn new(cores: Vec<CoreInfo>, housekeeping: Option<usize>) -> Result<Self, CpuSetError> {
        if cores.is_empty() {
            return Err(CpuSetError::InvalidRequest("no cores available".to_string()));
        }
        if let Some(hk) = housekeeping {
            if !cores.iter().any(|c| c.id == hk) {
                return Err(CpuSetError::InvalidRequest(format!(
                    "housekeeping core {hk} is not an available core"
                )));
            }
        }

        let usage = cores.iter().map(|c| (c.id, CoreUsage::Free)).collect();
        Ok(Self {
            cores,
            housekeeping,
            state: Mutex::new(PoolState {
                usage,
                sets: BTreeMap::new(),
                next_id: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // a panic while holding the lock leaves consistent bookkeeping
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All cores known to the pool
    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    pub fn housekeeping_core(&self) -> Option<usize> {
        self.housekeeping
    }

    /// Number of cores that can ever be reserved
    pub fn reservable_count(&self) -> usize {
        self.cores.len() - usize::from(self.housekeeping.is_some())
    }

    /// Number of reservable cores not held by any set
    pub fn free_count(&self) -> usize {
        let state = self.lock();
        self.reservable()
            .filter(|c| state.usage.get(&c.id) == Some(&CoreUsage::Free))
            .count()
    }

    /// Snapshot of every active set
    pub fn active_sets(&self) -> Vec<CpuSet> {
        self.lock().sets.values().cloned().collect()
    }

    fn reservable(&self) -> impl Iterator<Item = &CoreInfo> {
        self.cores
            .iter()
            .filter(move |c| Some(c.id) != self.housekeeping)
    }

    /// Reserve `count` cores, same-package first
    ///
    /// The smallest package that fits the request wins. When no single
    /// package fits, cores are taken from the largest packages first.
    fn reserve(&self, count: usize, exclusive: bool) -> Result<CpuSet, CpuSetError> {
        if count == 0 {
            return Err(CpuSetError::InvalidRequest(
                "cannot reserve zero cores".to_string(),
            ));
        }

        let mut state = self.lock();

        // candidate cores per package, least loaded first
        let mut by_package: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for core in self.reservable() {
            let load = match state.usage.get(&core.id) {
                Some(CoreUsage::Free) => 0,
                Some(CoreUsage::Shared(n)) if !exclusive => *n,
                _ => continue,
            };
            by_package.entry(core.package).or_default().push((load, core.id));
        }
        for candidates in by_package.values_mut() {
            candidates.sort_unstable();
        }

        let available: usize = by_package.values().map(Vec::len).sum();
        if available < count {
            return Err(CpuSetError::ResourceExhausted {
                requested: count,
                available,
            });
        }

        let mut cores: Vec<usize> = match by_package
            .values()
            .filter(|c| c.len() >= count)
            .min_by_key(|c| c.len())
        {
            Some(package) => package.iter().take(count).map(|&(_, id)| id).collect(),
            None => {
                let mut packages: Vec<&Vec<(usize, usize)>> = by_package.values().collect();
                packages.sort_by_key(|c| std::cmp::Reverse(c.len()));
                packages
                    .into_iter()
                    .flatten()
                    .take(count)
                    .map(|&(_, id)| id)
                    .collect()
            }
        };
        cores.sort_unstable();

        let id = CpuSetId(state.next_id);
        state.next_id += 1;

        for core in &cores {
            let usage = state.usage.entry(*core).or_insert(CoreUsage::Free);
            *usage = match (*usage, exclusive) {
                (_, true) => CoreUsage::Exclusive(id),
                (CoreUsage::Shared(n), false) => CoreUsage::Shared(n + 1),
                (_, false) => CoreUsage::Shared(1),
            };
        }

        let set = CpuSet {
            id,
            cores,
            processes: BTreeSet::new(),
            exclusive,
        };
        state.sets.insert(id, set.clone());
        Ok(set)
    }

    /// Return a set's cores; releasing an unknown id is a no-op
    fn release(&self, id: CpuSetId) -> Option<CpuSet> {
        let mut state = self.lock();
        let set = state.sets.remove(&id)?;
        for core in &set.cores {
            if let Some(usage) = state.usage.get_mut(core) {
                *usage = match *usage {
                    CoreUsage::Shared(n) if n > 1 => CoreUsage::Shared(n - 1),
                    _ => CoreUsage::Free,
                };
            }
        }
        Some(set)
    }

    fn track_process(&self, id: CpuSetId, pid: u32, bound: bool) {
        if let Some(set) = self.lock().sets.get_mut(&id) {
            if bound {
                set.processes.insert(pid);
            } else {
                set.processes.remove(&pid);
            }
        }
    }
}

/// Reserves core sets and binds processes to them
#[derive(Debug, Clone)]
pub struct CpuSetManager {
    pool: Arc<CpuPool>,
    backend: Arc<dyn IsolationBackend>,
}

impl CpuSetManager {
    /// Manager over every core the backend reports
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        housekeeping: Option<usize>,
    ) -> Result<Self, CpuSetError> {
        let cores = backend.enumerate_cores()?;
        let pool = CpuPool::new(cores, housekeeping)?;
        tracing::debug!(
            backend = backend.name(),
            cores = pool.cores().len(),
            ?housekeeping,
            "CPU pool initialized"
        );
        Ok(Self {
            pool: Arc::new(pool),
            backend,
        })
    }

    /// Manager over the host's own cores, bound by scheduler affinity
    #[cfg(target_os = "linux")]
    pub fn detect(housekeeping: Option<usize>) -> Result<Self, CpuSetError> {
        Self::open(&BackendKind::Affinity, housekeeping)
    }

    /// Manager over the host's cores through the backend `kind` names
    #[cfg(target_os = "linux")]
    pub fn open(kind: &BackendKind, housekeeping: Option<usize>) -> Result<Self, CpuSetError> {
        Self::new(kind.open()?, housekeeping)
    }

    pub fn pool(&self) -> &CpuPool {
        &self.pool
    }

    pub fn backend(&self) -> &dyn IsolationBackend {
        self.backend.as_ref()
    }

    /// Reserve `core_count` cores
    ///
    /// Fails with [`CpuSetError::ResourceExhausted`] when not enough cores are
    /// free. Exclusive sets never share a core with any other active set.
    pub fn reserve(&self, core_count: usize, exclusive: bool) -> Result<CpuSetHandle, CpuSetError> {
        let set = self.pool.reserve(core_count, exclusive)?;

        if exclusive {
            if let Err(e) = self.backend.mark_exclusive(&set.cores, true) {
                self.pool.release(set.id);
                return Err(e);
            }
        }

        tracing::debug!(id = %set.id, cores = ?set.cores, exclusive, "Reserved cpuset");
        Ok(CpuSetHandle {
            id: set.id,
            cores: set.cores,
            exclusive,
            pool: Arc::clone(&self.pool),
            backend: Arc::clone(&self.backend),
            released: false,
        })
    }

    /// Bind a running process and its future children to the handle's cores
    pub fn assign(&self, handle: &CpuSetHandle, pid: u32) -> Result<(), CpuSetError> {
        handle.assign(pid)
    }

    /// Return the handle's cores to the pool
    pub fn release(&self, handle: CpuSetHandle) {
        drop(handle);
    }
}

/// A reserved core set; released when dropped
#[derive(Debug)]
pub struct CpuSetHandle {
    id: CpuSetId,
    cores: Vec<usize>,
    exclusive: bool,
    pool: Arc<CpuPool>,
    backend: Arc<dyn IsolationBackend>,
    released: bool,
}

impl CpuSetHandle {
    pub fn id(&self) -> CpuSetId {
        self.id
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Bind a running process and its descendants to this set
    pub fn assign(&self, pid: u32) -> Result<(), CpuSetError> {
        self.backend.bind_process(pid, &self.cores)?;
        self.pool.track_process(self.id, pid, true);
        Ok(())
    }

    /// Make `command` start inside this set
    ///
    /// Keep the returned binding until the spawn has returned.
    pub fn prepare_command(&self, command: &mut Command) -> Result<ExecBinding, CpuSetError> {
        self.backend.prepare_command(command, &self.cores)
    }

    /// Record that a process started inside this set
    pub fn track_process(&self, pid: u32) {
        self.pool.track_process(self.id, pid, true);
    }

    /// Record that a process bound to this set has exited
    pub fn untrack_process(&self, pid: u32) {
        self.pool.track_process(self.id, pid, false);
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.exclusive {
            if let Err(e) = self.backend.mark_exclusive(&self.cores, false) {
                tracing::warn!(id = %self.id, "Failed to clear exclusive mark: {}", e);
            }
        }
        if let Err(e) = self.backend.release(&self.cores) {
            tracing::warn!(id = %self.id, "Backend release failed: {}", e);
        }
        self.pool.release(self.id);
        tracing::debug!(id = %self.id, "Released cpuset");
    }
}

impl Drop for CpuSetHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(packages: usize, per_package: usize, housekeeping: Option<usize>) -> CpuSetManager {
        CpuSetManager::new(
            Arc::new(FixedTopology::uniform(packages, per_package)),
            housekeeping,
        )
        .unwrap()
    }

    #[test]
    fn test_reserve_and_release() {
        let mgr = manager(1, 4, None);
        assert_eq!(mgr.pool().free_count(), 4);

        let handle = mgr.reserve(2, true).unwrap();
        assert_eq!(handle.cores().len(), 2);
        assert_eq!(mgr.pool().free_count(), 2);
        assert_eq!(mgr.pool().active_sets().len(), 1);

        mgr.release(handle);
        assert_eq!(mgr.pool().free_count(), 4);
        assert!(mgr.pool().active_sets().is_empty());
    }

    #[test]
    fn test_exclusive_sets_are_disjoint() {
        let mgr = manager(2, 4, None);
        let handles: Vec<_> = (0..4).map(|_| mgr.reserve(2, true).unwrap()).collect();

        let mut seen = BTreeSet::new();
        for handle in &handles {
            for core in handle.cores() {
                assert!(seen.insert(*core), "core {core} reserved twice");
            }
        }
        assert_eq!(mgr.pool().free_count(), 0);
    }

    #[test]
    fn test_resource_exhausted() {
        let mgr = manager(1, 4, None);
        let _held = mgr.reserve(3, true).unwrap();
        match mgr.reserve(2, true) {
            Err(CpuSetError::ResourceExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected ResourceExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_prefers_single_package() {
        let mgr = manager(2, 4, None);
        let _a = mgr.reserve(1, true).unwrap();

        // package 0 has 3 free cores, package 1 has 4; best fit is package 0
        let b = mgr.reserve(3, true).unwrap();
        assert!(b.cores().iter().all(|&c| c < 4));

        let c = mgr.reserve(4, true).unwrap();
        assert_eq!(c.cores(), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_spreads_when_no_package_fits() {
        let mgr = manager(2, 2, None);
        let handle = mgr.reserve(3, true).unwrap();
        assert_eq!(handle.cores().len(), 3);
        assert_eq!(mgr.pool().free_count(), 1);
    }

    #[test]
    fn test_housekeeping_core_excluded() {
        let mgr = manager(1, 4, Some(0));
        assert_eq!(mgr.pool().reservable_count(), 3);
        assert_eq!(mgr.pool().free_count(), 3);

        let handle = mgr.reserve(3, true).unwrap();
        assert!(!handle.cores().contains(&0));
        assert!(mgr.reserve(1, false).is_err());
    }

    #[test]
    fn test_invalid_housekeeping_core() {
        let result = CpuSetManager::new(Arc::new(FixedTopology::uniform(1, 2)), Some(9));
        assert!(matches!(result, Err(CpuSetError::InvalidRequest(_))));
    }

    #[test]
    fn test_shared_sets_overlap_but_not_exclusive() {
        let mgr = manager(1, 2, None);
        let a = mgr.reserve(2, false).unwrap();
        let b = mgr.reserve(2, false).unwrap();
        assert_eq!(a.cores(), b.cores());

        assert!(mgr.reserve(1, true).is_err());
        drop(a);
        assert!(mgr.reserve(1, true).is_err());
        drop(b);
        assert!(mgr.reserve(1, true).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let mgr = manager(1, 2, None);
        {
            let _handle = mgr.reserve(2, true).unwrap();
            assert_eq!(mgr.pool().free_count(), 0);
        }
        assert_eq!(mgr.pool().free_count(), 2);
    }

    #[test]
    fn test_assign_tracks_process() {
        let mgr = manager(1, 2, None);
        let handle = mgr.reserve(1, true).unwrap();
        mgr.assign(&handle, std::process::id()).unwrap();

        let sets = mgr.pool().active_sets();
        assert!(sets[0].processes.contains(&std::process::id()));

        handle.untrack_process(std::process::id());
        assert!(mgr.pool().active_sets()[0].processes.is_empty());
    }

    #[test]
    fn test_concurrent_reservations_never_overlap() {
        let mgr = manager(2, 8, None);
        std::thread::scope(|s| {
            for _ in 0..8 {
                let mgr = &mgr;
                s.spawn(move || {
                    for _ in 0..50 {
                        if let Ok(handle) = mgr.reserve(2, true) {
                            let sets = mgr.pool().active_sets();
                            let mut seen = BTreeSet::new();
                            for set in sets.iter().filter(|s| s.exclusive) {
                                for core in &set.cores {
                                    assert!(seen.insert(*core));
                                }
                            }
                            drop(handle);
                        }
                    }
                });
            }
        });
        assert_eq!(mgr.pool().free_count(), 16);
    }
}
