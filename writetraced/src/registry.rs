//! User-space PID registry (spec §4.3): turns "track this parent pid" into
//! bulk thread enrollment against the kernel TID map, and is the source of
//! truth the control API and liveness sweep both operate on.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use std::time::{Instant, SystemTime};

use log::warn;

use crate::error::RegistryError;

/// Abstracts the kernel-side TID hash map so the registry can be exercised
/// without a live eBPF map (tests use an in-memory fake).
pub trait KernelTidMap: Send + Sync {
    fn insert(&self, tid: u32) -> Result<(), String>;
    fn remove(&self, tid: u32) -> Result<(), String>;
    /// Number of TIDs currently present in the kernel-side map — the source
    /// of truth for the tracked-threads gauge (spec §4.9/§5), since fork-hook
    /// enrollments and exit-hook evictions happen kernel-side without ever
    /// touching the user-space registry.
    fn tid_count(&self) -> Result<usize, String>;
}

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub parent_pid: u32,
    pub thread_ids: HashSet<u32>,
    pub registered_at: Instant,
    pub registered_at_wall: SystemTime,
}

pub struct PidRegistry<M: KernelTidMap> {
    map: M,
    processes: RwLock<HashMap<u32, TrackedProcess>>,
}

impl<M: KernelTidMap> PidRegistry<M> {
    pub fn new(map: M) -> Self {
        Self {
            map,
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, pid: u32) -> Result<usize, RegistryError> {
        {
            let processes = self.processes.read().unwrap();
            if processes.contains_key(&pid) {
                return Err(RegistryError::AlreadyRegistered(pid));
            }
        }

        let tids = list_tids(pid)?;
        let mut inserted = Vec::with_capacity(tids.len());
        for &tid in &tids {
            match self.map.insert(tid) {
                Ok(()) => inserted.push(tid),
                Err(e) => {
                    for done in &inserted {
                        if let Err(rollback_err) = self.map.remove(*done) {
                            warn!("rollback failed to remove tid {done}: {rollback_err}");
                        }
                    }
                    return Err(RegistryError::KernelMap(e));
                }
            }
        }

        let count = tids.len();
        let entry = TrackedProcess {
            parent_pid: pid,
            thread_ids: tids,
            registered_at: Instant::now(),
            registered_at_wall: SystemTime::now(),
        };
        self.processes.write().unwrap().insert(pid, entry);
        Ok(count)
    }

    pub fn unregister(&self, pid: u32) -> Result<(), RegistryError> {
        let entry = {
            let mut processes = self.processes.write().unwrap();
            processes.remove(&pid).ok_or(RegistryError::NotRegistered(pid))?
        };
        for tid in &entry.thread_ids {
            if let Err(e) = self.map.remove(*tid) {
                warn!("failed to remove tid {tid} for pid {pid}: {e}");
            }
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<TrackedProcess> {
        self.processes.read().unwrap().values().cloned().collect()
    }

    pub fn is_registered(&self, pid: u32) -> bool {
        self.processes.read().unwrap().contains_key(&pid)
    }

    pub fn refresh_threads(&self, pid: u32) -> Result<usize, RegistryError> {
        let current_tids = list_tids(pid)?;

        let mut processes = self.processes.write().unwrap();
        let entry = processes
            .get_mut(&pid)
            .ok_or(RegistryError::NotRegistered(pid))?;

        let mut added = 0;
        for tid in current_tids {
            if entry.thread_ids.contains(&tid) {
                continue;
            }
            match self.map.insert(tid) {
                Ok(()) => {
                    entry.thread_ids.insert(tid);
                    added += 1;
                }
                Err(e) => warn!("failed to insert newly-seen tid {tid} for pid {pid}: {e}"),
            }
        }
        Ok(added)
    }

    /// Removes every registered parent whose `/proc/<pid>` directory no
    /// longer exists. Returns the pids that were evicted.
    pub fn sweep_dead(&self) -> Vec<u32> {
        let dead: Vec<u32> = {
            let processes = self.processes.read().unwrap();
            processes
                .keys()
                .copied()
                .filter(|pid| !Path::new(&format!("/proc/{pid}")).exists())
                .collect()
        };

        for pid in &dead {
            if let Err(e) = self.unregister(*pid) {
                warn!("liveness sweep failed to unregister pid {pid}: {e}");
            }
        }
        dead
    }

    /// Live TID count from the kernel map itself, not the user-space
    /// registry's view of it (see [`KernelTidMap::tid_count`]).
    pub fn kernel_tid_count(&self) -> Result<usize, String> {
        self.map.tid_count()
    }
}

/// Lists every TID under `/proc/<pid>/task`. `NotFound`-style failures are
/// mapped to [`RegistryError::ProcessNotFound`]; anything else is surfaced
/// as-is via `KernelMap` for consistency with other registry failures.
fn list_tids(pid: u32) -> Result<HashSet<u32>, RegistryError> {
    let dir = std::fs::read_dir(format!("/proc/{pid}/task"))
        .map_err(|_| RegistryError::ProcessNotFound(pid))?;

    let mut tids = HashSet::new();
    for entry in dir.flatten() {
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeMap {
        present: Mutex<HashSet<u32>>,
        fail_on: Mutex<Option<u32>>,
    }

    impl FakeMap {
        fn new() -> Self {
            Self {
                present: Mutex::new(HashSet::new()),
                fail_on: Mutex::new(None),
            }
        }
    }

    impl KernelTidMap for FakeMap {
        fn insert(&self, tid: u32) -> Result<(), String> {
            if *self.fail_on.lock().unwrap() == Some(tid) {
                return Err(format!("synthetic failure on tid {tid}"));
            }
            self.present.lock().unwrap().insert(tid);
            Ok(())
        }

        fn remove(&self, tid: u32) -> Result<(), String> {
            self.present.lock().unwrap().remove(&tid);
            Ok(())
        }

        fn tid_count(&self) -> Result<usize, String> {
            Ok(self.present.lock().unwrap().len())
        }
    }

    #[test]
    fn register_nonexistent_pid_fails_not_found() {
        let registry = PidRegistry::new(FakeMap::new());
        let result = registry.register(999_999_999);
        assert!(matches!(result, Err(RegistryError::ProcessNotFound(_))));
    }

    #[test]
    fn register_twice_fails_already_registered() {
        let registry = PidRegistry::new(FakeMap::new());
        let pid = std::process::id();
        registry.register(pid).unwrap();
        let result = registry.register(pid);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn unregister_unknown_pid_fails() {
        let registry = PidRegistry::new(FakeMap::new());
        assert!(matches!(
            registry.unregister(42),
            Err(RegistryError::NotRegistered(42))
        ));
    }

    #[test]
    fn registry_idempotence_register_unregister_register() {
        let registry = PidRegistry::new(FakeMap::new());
        let pid = std::process::id();
        let first = registry.register(pid).unwrap();
        registry.unregister(pid).unwrap();
        let second = registry.register(pid).unwrap();
        assert_eq!(first, second);
        assert!(registry.is_registered(pid));
    }

    #[test]
    fn list_returns_all_registered() {
        let registry = PidRegistry::new(FakeMap::new());
        let pid = std::process::id();
        registry.register(pid).unwrap();
        let snapshot = registry.list();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].parent_pid, pid);
    }

    #[test]
    fn kernel_tid_count_reflects_the_live_map_not_the_registry_snapshot() {
        let registry = PidRegistry::new(FakeMap::new());
        let pid = std::process::id();
        registry.register(pid).unwrap();
        let seeded = registry.kernel_tid_count().unwrap();
        assert!(seeded > 0);

        // A thread enrolled kernel-side (e.g. by the fork hook) never
        // touches the registry's own bookkeeping, but must still show up
        // here since the kernel map is the source of truth for the gauge.
        registry.map.insert(999_999).unwrap();
        assert_eq!(registry.kernel_tid_count().unwrap(), seeded + 1);
    }
}
