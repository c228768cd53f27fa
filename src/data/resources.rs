//! Memory and disk measurements used by the async output quotas.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Disks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of resource usage figures.
pub trait ResourceProbe: Send + Sync {
    /// Fraction (0..=1) of the memory budget currently used by this process.
    fn memory_fraction(&self) -> f64;

    /// Free bytes on the filesystem holding `path`, if it can be determined.
    fn free_disk_bytes(&self, path: &Path) -> Option<u64>;
}

/// Measures the live system with `sysinfo`.
///
/// Memory is this process's resident size over total physical RAM. Free disk
/// space comes from the mount point with the longest prefix of the path.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    /// Create a probe for the current process.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("Could not determine own pid; memory quota will read as zero");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn memory_fraction(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let total = system.total_memory();
        let used = system.process(pid).map(|p| p.memory()).unwrap_or(0);
        if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        }
    }

    fn free_disk_bytes(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// A probe whose readings are set by hand.
///
/// Used for dry runs and tests where quota behaviour must be deterministic.
#[derive(Debug)]
pub struct ManualProbe {
    memory_permille: AtomicU64,
    free_disk: AtomicU64,
}

impl ManualProbe {
    /// A probe reporting `memory_fraction` and `free_disk_bytes` as given.
    pub fn new(memory_fraction: f64, free_disk_bytes: u64) -> Self {
        let probe = Self {
            memory_permille: AtomicU64::new(0),
            free_disk: AtomicU64::new(free_disk_bytes),
        };
        probe.set_memory_fraction(memory_fraction);
        probe
    }

    /// Change the reported memory fraction.
    pub fn set_memory_fraction(&self, fraction: f64) {
        let permille = (fraction.clamp(0.0, 1.0) * 1000.0).round() as u64;
        self.memory_permille.store(permille, Ordering::SeqCst);
    }

    /// Change the reported free disk space.
    pub fn set_free_disk_bytes(&self, bytes: u64) {
        self.free_disk.store(bytes, Ordering::SeqCst);
    }
}

impl ResourceProbe for ManualProbe {
    fn memory_fraction(&self) -> f64 {
        self.memory_permille.load(Ordering::SeqCst) as f64 / 1000.0
    }

    fn free_disk_bytes(&self, _path: &Path) -> Option<u64> {
        Some(self.free_disk.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_probe_reports_plausible_values() {
        let probe = SysinfoProbe::new();
        let fraction = probe.memory_fraction();
        assert!((0.0..=1.0).contains(&fraction), "fraction {fraction}");
        let dir = tempfile::tempdir().unwrap();
        // Some sandboxes expose no mounts at all.
        let _ = probe.free_disk_bytes(dir.path());
    }

    #[test]
    fn manual_probe_round_trips() {
        let probe = ManualProbe::new(0.25, 1024);
        assert_eq!(probe.memory_fraction(), 0.25);
        probe.set_memory_fraction(0.9);
        probe.set_free_disk_bytes(7);
        assert_eq!(probe.memory_fraction(), 0.9);
        assert_eq!(probe.free_disk_bytes(Path::new("/")), Some(7));
    }
}
