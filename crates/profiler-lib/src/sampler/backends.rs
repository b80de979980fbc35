//! Counter backends
//!
//! `SysinfoCounters` exposes one instance per live pid for the CPU and
//! memory families. GPU engine counters have no portable source, so the GPU
//! sampler falls back to [`EmptyCounters`] which reports no instances.

use super::{CounterBackend, CounterError, CounterHandle, CounterInstance, MetricKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::info;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Process field a [`SysinfoCounters`] instance reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    /// Percent of one core
    CpuPercent,
    /// Resident memory in MB
    ResidentMb,
    /// Virtual memory size in MB
    VirtualMb,
}

impl CounterField {
    fn refresh_kind(&self) -> ProcessRefreshKind {
        match self {
            CounterField::CpuPercent => ProcessRefreshKind::new().with_cpu(),
            CounterField::ResidentMb | CounterField::VirtualMb => {
                ProcessRefreshKind::new().with_memory()
            }
        }
    }

    fn read(&self, process: &sysinfo::Process) -> f64 {
        match self {
            CounterField::CpuPercent => process.cpu_usage() as f64,
            CounterField::ResidentMb => process.memory() as f64 / BYTES_PER_MB,
            CounterField::VirtualMb => process.virtual_memory() as f64 / BYTES_PER_MB,
        }
    }
}

/// Per-pid counters read from the `sysinfo` process table
///
/// Every instance owns its own `System`, so samplers never contend on it.
/// The process table is refreshed once per cycle in `instances`; `collect`
/// reads that snapshot, so CPU deltas span the whole sampler period.
pub struct SysinfoCounters {
    field: CounterField,
    system: Arc<Mutex<System>>,
    readings: Mutex<HashMap<Pid, f64>>,
    handles: Mutex<HashMap<u64, Pid>>,
    next_handle: AtomicU64,
}

impl SysinfoCounters {
    pub fn new(field: CounterField) -> Self {
        Self {
            field,
            system: Arc::new(Mutex::new(System::new())),
            readings: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Refresh the whole process table and read `field` for `wanted`
    fn refresh_blocking(
        system: &Mutex<System>,
        field: CounterField,
        wanted: &[Pid],
    ) -> Result<HashMap<Pid, f64>, CounterError> {
        let mut sys = system
            .lock()
            .map_err(|_| CounterError::Unavailable("process table lock poisoned".to_string()))?;
        // Per-pid refreshes never yield cpu_usage, only a full pass does
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, field.refresh_kind());
        Ok(wanted
            .iter()
            .filter_map(|pid| sys.process(*pid).map(|process| (*pid, field.read(process))))
            .collect())
    }
}

#[async_trait]
impl CounterBackend for SysinfoCounters {
    async fn instances(&self, pids: &[u32]) -> Result<Vec<CounterInstance>, CounterError> {
        let wanted: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        let system = Arc::clone(&self.system);
        let field = self.field;
        let query = wanted.clone();
        let readings = tokio::task::spawn_blocking(move || {
            Self::refresh_blocking(&system, field, &query)
        })
        .await
        .map_err(|e| CounterError::Unavailable(e.to_string()))??;

        let instances = wanted
            .iter()
            .filter(|pid| readings.contains_key(*pid))
            .map(|pid| CounterInstance::for_pid(pid.as_u32()))
            .collect();

        let mut current = self
            .readings
            .lock()
            .map_err(|_| CounterError::Unavailable("readings lock poisoned".to_string()))?;
        *current = readings;
        Ok(instances)
    }

    async fn register(&self, instance: &CounterInstance) -> Result<CounterHandle, CounterError> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .map_err(|_| CounterError::Unavailable("handle table lock poisoned".to_string()))?
            .insert(id, Pid::from_u32(instance.pid));
        Ok(CounterHandle(id))
    }

    async fn collect(&self, handle: CounterHandle) -> Result<f64, CounterError> {
        let pid = self
            .handles
            .lock()
            .map_err(|_| CounterError::Unavailable("handle table lock poisoned".to_string()))?
            .get(&handle.0)
            .copied()
            .ok_or_else(|| CounterError::Query {
                instance: handle.0.to_string(),
                message: "unknown handle".to_string(),
            })?;

        self.readings
            .lock()
            .map_err(|_| CounterError::Unavailable("readings lock poisoned".to_string()))?
            .get(&pid)
            .copied()
            .ok_or_else(|| CounterError::InstanceGone(pid.to_string()))
    }

    async fn release_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.clear();
        }
        if let Ok(mut readings) = self.readings.lock() {
            readings.clear();
        }
    }
}

/// Backend for counter families the host cannot provide
#[derive(Debug, Default)]
pub struct EmptyCounters;

#[async_trait]
impl CounterBackend for EmptyCounters {
    async fn instances(&self, _pids: &[u32]) -> Result<Vec<CounterInstance>, CounterError> {
        Ok(Vec::new())
    }

    async fn register(&self, instance: &CounterInstance) -> Result<CounterHandle, CounterError> {
        Err(CounterError::Query {
            instance: instance.key.clone(),
            message: "no counters available on this host".to_string(),
        })
    }

    async fn collect(&self, handle: CounterHandle) -> Result<f64, CounterError> {
        Err(CounterError::Query {
            instance: handle.0.to_string(),
            message: "no counters available on this host".to_string(),
        })
    }
}

/// Create the host backend for a metric family
pub fn create_backend(kind: MetricKind) -> Arc<dyn CounterBackend> {
    match kind {
        MetricKind::Cpu => Arc::new(SysinfoCounters::new(CounterField::CpuPercent)),
        MetricKind::Memory => Arc::new(SysinfoCounters::new(CounterField::ResidentMb)),
        MetricKind::VirtualSize => Arc::new(SysinfoCounters::new(CounterField::VirtualMb)),
        MetricKind::Gpu => {
            info!("No GPU engine counters on this host, GPU values will read 0");
            Arc::new(EmptyCounters)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{MetricSampler, SamplerConfig};
    use crate::tracker::{LabelCriteria, ProcessTracker};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cpu_sampler_reports_busy_process() {
        let spinning = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&spinning);
        let busy = std::thread::spawn(move || {
            let mut x: u64 = 1;
            while flag.load(Ordering::Relaxed) {
                x = std::hint::black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1));
            }
        });

        let tracker = Arc::new(ProcessTracker::new("self", LabelCriteria::default()));
        let mut sampler = MetricSampler::new(
            MetricKind::Cpu,
            SamplerConfig::default(),
            create_backend(MetricKind::Cpu),
            tracker,
        );
        let cache = sampler.cache();
        let own = std::process::id();

        let mut readings = Vec::new();
        for _ in 0..4 {
            sampler.sample(&[own]).await;
            readings.push(cache.read(own));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        spinning.store(false, Ordering::Relaxed);
        busy.join().unwrap();

        let last = *readings.last().unwrap();
        assert!(last > 10.0, "cpu readings per cycle: {:?}", readings);
    }

    #[tokio::test]
    async fn test_collect_reads_last_refresh() {
        let backend = SysinfoCounters::new(CounterField::CpuPercent);
        let own = std::process::id();

        // Registered but absent from the refreshed snapshot
        let missing = backend
            .register(&CounterInstance::for_pid(u32::MAX - 1))
            .await
            .unwrap();
        let instances = backend.instances(&[own, u32::MAX - 1]).await.unwrap();
        assert_eq!(instances, vec![CounterInstance::for_pid(own)]);

        let err = backend.collect(missing).await.unwrap_err();
        assert!(matches!(err, CounterError::InstanceGone(_)));

        let handle = backend.register(&instances[0]).await.unwrap();
        assert!(backend.collect(handle).await.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_sysinfo_counters_track_own_process() {
        let backend = SysinfoCounters::new(CounterField::ResidentMb);
        let own = std::process::id();

        let instances = backend.instances(&[own]).await.unwrap();
        assert_eq!(instances, vec![CounterInstance::for_pid(own)]);

        let handle = backend.register(&instances[0]).await.unwrap();
        let resident = backend.collect(handle).await.unwrap();
        assert!(resident > 0.0);
    }

    #[tokio::test]
    async fn test_sysinfo_counters_unknown_handle() {
        let backend = SysinfoCounters::new(CounterField::CpuPercent);
        let err = backend.collect(CounterHandle(999)).await.unwrap_err();
        assert!(!err.is_backend_failure());
    }

    #[tokio::test]
    async fn test_release_all_forgets_handles() {
        let backend = SysinfoCounters::new(CounterField::VirtualMb);
        let handle = backend
            .register(&CounterInstance::for_pid(std::process::id()))
            .await
            .unwrap();
        backend.release_all().await;
        assert!(backend.collect(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_counters_report_nothing() {
        let backend = create_backend(MetricKind::Gpu);
        assert!(backend.instances(&[1, 2, 3]).await.unwrap().is_empty());
    }
}
