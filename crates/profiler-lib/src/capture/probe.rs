//! One-shot host queries made by the capture loop
//!
//! Memory-family figures are read synchronously per process every capture
//! cycle instead of through a sampler cache.

use crate::models::MemoryUtilization;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process {0} is gone")]
    ProcessGone(u32),
    #[error("host query failed: {0}")]
    Unavailable(String),
}

/// Machine-wide figures for one capture cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    /// Machine CPU load, percent of one core
    pub cpu_percent: f64,
    pub total_memory_mb: f64,
    pub free_memory_mb: f64,
}

/// Trait for synchronous host queries
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Per-process memory fields for `pid`; system-wide fields are left 0
    async fn process_memory(&self, pid: u32) -> Result<MemoryUtilization, ProbeError>;

    async fn system_snapshot(&self) -> Result<SystemSnapshot, ProbeError>;
}

/// Host probe backed by `sysinfo`
///
/// Table refreshes run on the blocking pool so a slow refresh never stalls
/// the runtime's workers.
pub struct SysinfoProbe {
    system: Arc<Mutex<System>>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn lock(system: &Mutex<System>) -> Result<MutexGuard<'_, System>, ProbeError> {
        system
            .lock()
            .map_err(|_| ProbeError::Unavailable("system table lock poisoned".to_string()))
    }

    /// Resident and virtual size of `pid` in MB
    fn process_sizes_blocking(system: &Mutex<System>, pid: u32) -> Result<(f64, f64), ProbeError> {
        let target = Pid::from_u32(pid);
        let mut sys = Self::lock(system)?;
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let process = sys.process(target).ok_or(ProbeError::ProcessGone(pid))?;
        Ok((
            process.memory() as f64 / BYTES_PER_MB,
            process.virtual_memory() as f64 / BYTES_PER_MB,
        ))
    }

    fn system_snapshot_blocking(system: &Mutex<System>) -> Result<SystemSnapshot, ProbeError> {
        let mut sys = Self::lock(system)?;
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let cores = sys.cpus().len().max(1) as f64;
        Ok(SystemSnapshot {
            cpu_percent: sys.global_cpu_usage() as f64 * cores,
            total_memory_mb: sys.total_memory() as f64 / BYTES_PER_MB,
            free_memory_mb: sys.available_memory() as f64 / BYTES_PER_MB,
        })
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProbe for SysinfoProbe {
    async fn process_memory(&self, pid: u32) -> Result<MemoryUtilization, ProbeError> {
        let system = Arc::clone(&self.system);
        let (rss_mb, vms_mb) =
            tokio::task::spawn_blocking(move || Self::process_sizes_blocking(&system, pid))
                .await
                .map_err(|e| ProbeError::Unavailable(e.to_string()))??;

        Ok(MemoryUtilization {
            uss_mb: unique_set_mb(pid).await,
            rss_mb,
            vms_mb,
            ..Default::default()
        })
    }

    async fn system_snapshot(&self) -> Result<SystemSnapshot, ProbeError> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || Self::system_snapshot_blocking(&system))
            .await
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?
    }
}

/// Unique set size from `/proc/<pid>/smaps_rollup`, 0 when unreadable
#[cfg(target_os = "linux")]
async fn unique_set_mb(pid: u32) -> f64 {
    tokio::fs::read_to_string(format!("/proc/{}/smaps_rollup", pid))
        .await
        .map(|rollup| parse_private_kb(&rollup) / 1024.0)
        .unwrap_or(0.0)
}

#[cfg(not(target_os = "linux"))]
async fn unique_set_mb(_pid: u32) -> f64 {
    0.0
}

/// Sum of the `Private_Clean` and `Private_Dirty` lines, in kB
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_private_kb(rollup: &str) -> f64 {
    rollup
        .lines()
        .filter(|line| line.starts_with("Private_Clean:") || line.starts_with("Private_Dirty:"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|kb| kb.parse::<f64>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_kb() {
        let rollup = "\
00400000-7ffd1234 ---p 00000000 00:00 0 [rollup]
Rss:               10240 kB
Pss:                8000 kB
Private_Clean:      1024 kB
Private_Dirty:      2048 kB
Swap:                  0 kB
";
        assert_eq!(parse_private_kb(rollup), 3072.0);
        assert_eq!(parse_private_kb(""), 0.0);
    }

    #[tokio::test]
    async fn test_probe_reads_own_process() {
        let probe = SysinfoProbe::new();
        let memory = probe.process_memory(std::process::id()).await.unwrap();
        assert!(memory.rss_mb > 0.0);
        assert_eq!(memory.system_total_mb, 0.0);

        let snapshot = probe.system_snapshot().await.unwrap();
        assert!(snapshot.total_memory_mb > 0.0);
        assert!(snapshot.cpu_percent >= 0.0);
    }
}
