//! Capture loop
//!
//! Each tick reconciles the tracked process set, reads the latest value
//! every sampler published for every tracked pid, queries memory directly,
//! and appends per-process records followed by their aggregates to the
//! history in one write.

use super::persist::AppendLog;
use super::probe::{HostProbe, SystemSnapshot};
use crate::health::{components, HealthRegistry};
use crate::history::History;
use crate::models::{HistoryRecord, MemoryUtilization, ProcessIdentity};
use crate::observability::{ProfilerMetrics, StructuredLogger};
use crate::sampler::SampleCache;
use crate::shutdown::StopListener;
use crate::tracker::{ProcessSource, ProcessTracker};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the capture loop
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Process name to follow
    pub target: String,
    /// Target period between cycle starts (default: 1 second)
    pub period: Duration,
    /// Lower bound on the sleep between cycles (default: 100 ms)
    pub min_sleep: Duration,
    /// Emit only aggregate records
    pub totals_only: bool,
    /// Emit the whole-system record
    pub system_record: bool,
    /// Append every cycle to the history log
    pub persist: bool,
    /// Directory holding the history log
    pub log_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            period: Duration::from_secs(1),
            min_sleep: Duration::from_millis(100),
            totals_only: false,
            system_record: true,
            persist: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl CaptureConfig {
    pub fn next_sleep(&self, elapsed: Duration) -> Duration {
        self.period.saturating_sub(elapsed).max(self.min_sleep)
    }
}

/// Pause switch shared between the capture loop and its controllers
///
/// Clones share the same flag. Pausing and resuming are idempotent.
#[derive(Debug, Clone, Default)]
pub struct CaptureControl {
    paused: Arc<AtomicBool>,
}

impl CaptureControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Capture paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Capture resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Caches the capture loop reads from, one per sampler
#[derive(Debug, Clone)]
pub struct SamplerCaches {
    pub cpu: SampleCache,
    /// `None` when GPU sampling is disabled
    pub gpu: Option<SampleCache>,
    /// Externally reported memory figure
    pub memory: SampleCache,
    pub virtual_size: SampleCache,
}

impl SamplerCaches {
    /// Drop published values for pids that left the tracked set
    pub fn forget(&self, pids: &[u32]) {
        self.cpu.forget(pids);
        if let Some(gpu) = &self.gpu {
            gpu.forget(pids);
        }
        self.memory.forget(pids);
        self.virtual_size.forget(pids);
    }

    fn gpu(&self, pid: u32) -> f64 {
        self.gpu.as_ref().map_or(0.0, |cache| cache.read(pid))
    }
}

/// Result of one capture tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// `records` records were appended to history
    Captured { records: usize },
    /// Nothing to capture this cycle
    Skipped(String),
    /// Capture is paused; history untouched
    Paused,
    /// The cycle could not be assembled; retried next period
    Failed(String),
}

pub struct CaptureOrchestrator {
    config: CaptureConfig,
    source: Arc<dyn ProcessSource>,
    tracker: Arc<ProcessTracker>,
    probe: Arc<dyn HostProbe>,
    caches: SamplerCaches,
    history: Arc<RwLock<History>>,
    control: CaptureControl,
    log: Option<AppendLog>,
    health: Option<HealthRegistry>,
    metrics: ProfilerMetrics,
    logger: StructuredLogger,
    failing: bool,
    persist_failing: bool,
}

impl CaptureOrchestrator {
    pub fn new(
        config: CaptureConfig,
        source: Arc<dyn ProcessSource>,
        tracker: Arc<ProcessTracker>,
        probe: Arc<dyn HostProbe>,
        caches: SamplerCaches,
        history: Arc<RwLock<History>>,
    ) -> Self {
        let log = config
            .persist
            .then(|| AppendLog::for_target(&config.log_dir, &config.target));
        let logger = StructuredLogger::new(config.target.clone());

        Self {
            config,
            source,
            tracker,
            probe,
            caches,
            history,
            control: CaptureControl::new(),
            log,
            health: None,
            metrics: ProfilerMetrics::new(),
            logger,
            failing: false,
            persist_failing: false,
        }
    }

    /// Report cycle and persistence failures to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Share an existing pause switch
    pub fn with_control(mut self, control: CaptureControl) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> CaptureControl {
        self.control.clone()
    }

    /// Run the capture loop until a stop is requested
    pub async fn run(mut self, mut stop: StopListener) {
        info!(
            target_name = %self.config.target,
            period_ms = self.config.period.as_millis() as u64,
            totals_only = self.config.totals_only,
            persist = self.config.persist,
            "Starting capture loop"
        );

        let mut cycles = 0u64;
        while !stop.should_stop() {
            let start = Instant::now();
            let outcome = self.tick().await;
            let elapsed = start.elapsed();
            cycles += 1;

            self.metrics.observe_capture_latency(elapsed.as_secs_f64());
            self.report(&outcome).await;

            stop.sleep(self.config.next_sleep(elapsed)).await;
        }

        info!(target_name = %self.config.target, cycles, "Capture loop stopped");
    }

    /// Run one capture cycle
    pub async fn tick(&mut self) -> CycleOutcome {
        if self.control.is_paused() {
            return CycleOutcome::Paused;
        }

        let listed = match self.source.list(&self.config.target).await {
            Ok(listed) => listed,
            Err(e) => return CycleOutcome::Failed(e.to_string()),
        };
        let diff = self.tracker.reconcile(&listed).await;
        if !diff.removed.is_empty() {
            self.caches.forget(&diff.removed);
        }

        let processes = self.tracker.snapshot().await;
        self.metrics.set_tracked_processes(processes.len() as i64);
        if processes.is_empty() {
            return CycleOutcome::Skipped("no tracked processes".to_string());
        }

        let timestamp = chrono::Utc::now().timestamp();
        let system = match self.probe.system_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "System snapshot failed, system memory reads 0");
                SystemSnapshot::default()
            }
        };

        let mut per_process = Vec::with_capacity(processes.len());
        let mut total_memory = MemoryUtilization::default();
        let mut total_cpu = 0.0;
        let mut total_gpu = 0.0;

        for process in &processes {
            let mut memory = match self.probe.process_memory(process.pid).await {
                Ok(memory) => memory,
                Err(e) => {
                    debug!(pid = process.pid, error = %e, "Skipping process this cycle");
                    continue;
                }
            };
            memory.system_total_mb = system.total_memory_mb;
            memory.system_free_mb = system.free_memory_mb;
            memory.external_mb = self.caches.memory.read(process.pid);
            memory.virtual_size_mb = self.caches.virtual_size.read(process.pid);

            let cpu_percent = self.caches.cpu.read(process.pid);
            let gpu_percent = self.caches.gpu(process.pid);

            total_memory.accumulate(&memory);
            total_cpu += cpu_percent;
            total_gpu += gpu_percent;

            per_process.push(HistoryRecord {
                timestamp,
                process: ProcessIdentity::tracked(
                    process.pid,
                    self.config.target.clone(),
                    process.label.clone(),
                ),
                memory,
                cpu_percent,
                gpu_percent,
            });
        }

        if per_process.is_empty() {
            return CycleOutcome::Skipped("every tracked process vanished".to_string());
        }

        total_memory.system_total_mb = system.total_memory_mb;
        total_memory.system_free_mb = system.free_memory_mb;

        let mut records = if self.config.totals_only {
            Vec::with_capacity(2)
        } else {
            per_process
        };
        records.push(HistoryRecord {
            timestamp,
            process: ProcessIdentity::aggregate(self.config.target.clone()),
            memory: total_memory,
            cpu_percent: total_cpu,
            gpu_percent: total_gpu,
        });
        if self.config.system_record {
            records.push(self.system_record(timestamp, &system));
        }

        let count = records.len();
        {
            let mut history = self.history.write().await;
            history.append_batch(records.iter().cloned());
            self.metrics
                .set_history(history.len() as i64, history.version() as i64);
        }

        self.persist(records).await;

        CycleOutcome::Captured { records: count }
    }

    /// Whole-machine record; resident memory is machine memory in use
    fn system_record(&self, timestamp: i64, system: &SystemSnapshot) -> HistoryRecord {
        HistoryRecord {
            timestamp,
            process: ProcessIdentity::whole_system(self.config.target.clone()),
            memory: MemoryUtilization {
                system_total_mb: system.total_memory_mb,
                system_free_mb: system.free_memory_mb,
                rss_mb: (system.total_memory_mb - system.free_memory_mb).max(0.0),
                ..Default::default()
            },
            cpu_percent: system.cpu_percent,
            gpu_percent: 0.0,
        }
    }

    async fn persist(&mut self, records: Vec<HistoryRecord>) {
        let Some(log) = &self.log else {
            return;
        };

        match log.append_offloaded(records).await {
            Ok(()) => {
                if self.persist_failing {
                    self.persist_failing = false;
                    if let Some(health) = &self.health {
                        health.set_healthy(components::PERSISTENCE).await;
                    }
                }
            }
            Err(e) => {
                self.metrics.inc_persistence_errors();
                self.logger
                    .log_persistence_failure(&log.path().display().to_string(), &format!("{:#}", e));
                if !self.persist_failing {
                    self.persist_failing = true;
                    if let Some(health) = &self.health {
                        health
                            .set_degraded(components::PERSISTENCE, "history log not writable")
                            .await;
                    }
                }
            }
        }
    }

    async fn report(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Failed(reason) => {
                warn!(
                    target_name = %self.config.target,
                    error = %reason,
                    "Capture cycle failed, retrying next period"
                );
                self.metrics.inc_capture_errors();
                if !self.failing {
                    self.failing = true;
                    if let Some(health) = &self.health {
                        health.set_degraded(components::CAPTURE, reason.clone()).await;
                    }
                }
            }
            CycleOutcome::Skipped(reason) => {
                debug!(target_name = %self.config.target, reason = %reason, "Capture cycle skipped");
            }
            CycleOutcome::Captured { records } => {
                debug!(target_name = %self.config.target, records, "Capture cycle complete");
            }
            CycleOutcome::Paused => {}
        }

        if self.failing && !matches!(outcome, CycleOutcome::Failed(_)) {
            self.failing = false;
            if let Some(health) = &self.health {
                health.set_healthy(components::CAPTURE).await;
            }
        }
    }
}
