//! Cgroup v2 management
//!
//! Each supervised unit gets its own cgroup:
//!
//! /sys/fs/cgroup/
//! └── warden.slice/
//!     ├── auto-rsa/       # memory.max, cpu.max
//!     └── watchtower/

use std::io;
use std::path::{Path, PathBuf};

use crate::units::ResourceLimits;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const SLICE: &str = "warden.slice";

pub struct CgroupManager {
    root: PathBuf,
}

impl CgroupManager {
    pub fn new() -> io::Result<Self> {
        Self::with_root(CGROUP_ROOT)
    }

    /// Use a cgroup2 hierarchy mounted somewhere other than /sys/fs/cgroup
    pub fn with_root(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();

        // Verify cgroup2 is mounted
        if !root.join("cgroup.controllers").exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cgroup v2 not mounted at {}", root.display()),
            ));
        }

        Ok(Self { root })
    }

    /// Cgroup path for a unit
    pub fn service_path(&self, name: &str) -> PathBuf {
        self.root.join(SLICE).join(name)
    }

    /// Create the unit's cgroup, apply its limits and move `pid` into it
    pub fn setup_service_cgroup(
        &self,
        name: &str,
        pid: u32,
        limits: &ResourceLimits,
    ) -> io::Result<PathBuf> {
        let path = self.service_path(name);
        std::fs::create_dir_all(&path)?;

        if let Some(bytes) = limits.memory_bytes {
            self.set_memory_max(&path, bytes)?;
        }
        if let Some(percent) = limits.cpu_percent() {
            self.set_cpu_quota(&path, percent)?;
        }

        self.add_pid(&path, pid)?;
        log::info!("Created cgroup: {}", path.display());
        Ok(path)
    }

    /// Remove the unit's cgroup once its processes are gone
    pub fn cleanup_service_cgroup(&self, name: &str) -> io::Result<()> {
        let path = self.service_path(name);
        if !path.exists() {
            return Ok(());
        }
        self.remove_cgroup(&path)
    }

    /// Move a process into a cgroup
    pub fn add_pid(&self, cgroup_path: &Path, pid: u32) -> io::Result<()> {
        let procs_file = cgroup_path.join("cgroup.procs");
        std::fs::write(&procs_file, pid.to_string())?;
        log::debug!("Moved PID {} to {}", pid, cgroup_path.display());
        Ok(())
    }

    /// Get all PIDs in a cgroup
    pub fn get_pids(&self, cgroup_path: &Path) -> io::Result<Vec<u32>> {
        let procs_file = cgroup_path.join("cgroup.procs");
        let content = std::fs::read_to_string(&procs_file)?;

        let pids: Vec<u32> = content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();

        Ok(pids)
    }

    /// Check if cgroup is empty (no processes)
    pub fn is_empty(&self, cgroup_path: &Path) -> io::Result<bool> {
        let pids = self.get_pids(cgroup_path)?;
        Ok(pids.is_empty())
    }

    /// Remove an empty cgroup
    pub fn remove_cgroup(&self, cgroup_path: &Path) -> io::Result<()> {
        if !self.is_empty(cgroup_path)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cgroup is not empty",
            ));
        }

        std::fs::remove_dir(cgroup_path)?;
        log::info!("Removed cgroup: {}", cgroup_path.display());
        Ok(())
    }

    /// Set memory limit for a cgroup
    pub fn set_memory_max(&self, cgroup_path: &Path, bytes: u64) -> io::Result<()> {
        let file = cgroup_path.join("memory.max");
        std::fs::write(&file, bytes.to_string())?;
        Ok(())
    }

    /// Set CPU quota for a cgroup (percentage, e.g., 50 = half a core)
    pub fn set_cpu_quota(&self, cgroup_path: &Path, percent: u32) -> io::Result<()> {
        // Microseconds per 100ms period: 50% = 50000us per 100000us
        let quota_us = percent as u64 * 1000;
        let file = cgroup_path.join("cpu.max");
        std::fs::write(&file, format!("{} 100000", quota_us))?;
        Ok(())
    }
}
