// src/supervisor/resource_manager.rs
//! OS-level resource caps and usage reporting
//!
//! Applies coarse memory/CPU caps (cgroups on Linux) and scheduling
//! priority to worker processes, and reports live usage from /proc.
//! Cap application is best-effort: a host without cgroup access still
//! runs workers, just uncapped.

use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Resource limits for a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU quota as percentage (100 = one full core)
    pub cpu_quota: Option<u32>,

    /// Memory limit in megabytes
    pub memory_limit_mb: Option<u64>,

    /// Scheduling niceness (-20..=19)
    pub nice: Option<i32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_quota: Some(100),
            memory_limit_mb: Some(512),
            nice: None,
        }
    }
}

impl ResourceLimits {
    /// No restrictions
    pub fn unlimited() -> Self {
        Self {
            cpu_quota: None,
            memory_limit_mb: None,
            nice: None,
        }
    }

    /// Validate limit values
    pub fn validate(&self) -> Result<()> {
        if let Some(quota) = self.cpu_quota {
            if quota == 0 {
                return Err(FleetError::Config("CPU quota cannot be 0".into()));
            }
            if quota > 400 {
                return Err(FleetError::Config(
                    "CPU quota cannot exceed 400% (4 cores)".into(),
                ));
            }
        }
        if let Some(memory) = self.memory_limit_mb {
            if memory < 64 {
                return Err(FleetError::Config(
                    "memory limit cannot be less than 64MB".into(),
                ));
            }
        }
        if let Some(nice) = self.nice {
            if !(-20..=19).contains(&nice) {
                return Err(FleetError::Config("nice must be in -20..=19".into()));
            }
        }
        Ok(())
    }
}

/// Live usage sampled from the OS
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    /// Resident set size in megabytes
    pub rss_mb: u64,

    /// Cumulative CPU time in seconds (user + system)
    pub cpu_secs: u64,
}

/// Applies limits to PIDs and reports their usage
pub struct ResourceManager {
    cgroup_prefix: String,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            cgroup_prefix: "agent-fleet".to_string(),
        }
    }

    /// Apply limits to a running process
    pub fn apply(&self, pid: u32, limits: &ResourceLimits) -> Result<()> {
        limits.validate()?;
        debug!("Applying resource limits to PID {}", pid);

        if let Some(quota) = limits.cpu_quota {
            self.apply_cpu_limit(pid, quota);
        }
        if let Some(memory) = limits.memory_limit_mb {
            self.apply_memory_limit(pid, memory);
        }
        if let Some(nice) = limits.nice {
            apply_nice(pid, nice);
        }

        Ok(())
    }

    /// Apply CPU cap using cgroups (Linux only)
    #[cfg(target_os = "linux")]
    fn apply_cpu_limit(&self, pid: u32, quota: u32) {
        use std::fs;

        let cgroup_path = format!("/sys/fs/cgroup/cpu/{}-{}", self.cgroup_prefix, pid);
        if let Err(e) = fs::create_dir_all(&cgroup_path) {
            warn!("Failed to create cgroup directory: {}", e);
            return;
        }

        let period: u64 = 100_000;
        let quota_value = (quota as u64 * period) / 100;

        let _ = fs::write(
            format!("{}/cpu.cfs_quota_us", cgroup_path),
            quota_value.to_string(),
        );
        let _ = fs::write(
            format!("{}/cpu.cfs_period_us", cgroup_path),
            period.to_string(),
        );
        let _ = fs::write(format!("{}/cgroup.procs", cgroup_path), pid.to_string());
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_cpu_limit(&self, _pid: u32, _quota: u32) {
        warn!("CPU limiting not supported on this platform");
    }

    /// Apply memory cap using cgroups (Linux only)
    #[cfg(target_os = "linux")]
    fn apply_memory_limit(&self, pid: u32, limit_mb: u64) {
        use std::fs;

        let cgroup_path = format!("/sys/fs/cgroup/memory/{}-{}", self.cgroup_prefix, pid);
        if let Err(e) = fs::create_dir_all(&cgroup_path) {
            warn!("Failed to create cgroup directory: {}", e);
            return;
        }

        let limit_bytes = limit_mb * 1024 * 1024;
        let _ = fs::write(
            format!("{}/memory.limit_in_bytes", cgroup_path),
            limit_bytes.to_string(),
        );
        let _ = fs::write(format!("{}/cgroup.procs", cgroup_path), pid.to_string());
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_memory_limit(&self, _pid: u32, _limit_mb: u64) {
        warn!("Memory limiting not supported on this platform");
    }

    /// Remove cgroup state for an exited process
    pub fn cleanup(&self, pid: u32) {
        #[cfg(target_os = "linux")]
        {
            let cpu = format!("/sys/fs/cgroup/cpu/{}-{}", self.cgroup_prefix, pid);
            let mem = format!("/sys/fs/cgroup/memory/{}-{}", self.cgroup_prefix, pid);
            let _ = std::fs::remove_dir_all(cpu);
            let _ = std::fs::remove_dir_all(mem);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = pid;
    }

    /// Sample live usage for a PID from /proc (Linux only)
    #[cfg(target_os = "linux")]
    pub fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_usage(&statm, &stat)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn usage(&self, _pid: u32) -> Option<ResourceUsage> {
        None
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower the scheduling priority of a process
fn apply_nice(pid: u32, nice: i32) {
    // setpriority returns -1 on failure; a denied renice is not fatal.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, nice) };
    if rc == -1 {
        warn!("Failed to set nice={} for PID {}", nice, pid);
    }
}

/// Parse RSS and CPU time out of /proc statm + stat content
#[cfg(target_os = "linux")]
fn parse_usage(statm: &str, stat: &str) -> Option<ResourceUsage> {
    const PAGE_SIZE: u64 = 4096;
    const CLK_TCK: u64 = 100;

    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;

    // Fields 14/15 (1-based) of /proc/<pid>/stat are utime/stime in ticks.
    // The comm field can contain spaces, so split after the closing paren.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    Some(ResourceUsage {
        rss_mb: rss_pages * PAGE_SIZE / (1024 * 1024),
        cpu_secs: (utime + stime) / CLK_TCK,
    })
}
