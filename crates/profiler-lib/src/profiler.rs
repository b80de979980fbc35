//! Engine assembly and lifecycle
//!
//! [`ProfilerBuilder`] wires the tracker, the samplers, the capture loop and
//! the history store together. [`Profiler::start`] verifies the target is
//! running, then spawns one task per loop; [`RunningProfiler`] stops and
//! joins them.

use crate::capture::{
    CaptureConfig, CaptureControl, CaptureOrchestrator, HostProbe, SamplerCaches, SysinfoProbe,
};
use crate::health::HealthRegistry;
use crate::history::{History, DEFAULT_CAPACITY};
use crate::observability::StructuredLogger;
use crate::query::ProfilerHandle;
use crate::sampler::{create_backend, CounterBackend, MetricKind, MetricSampler, SamplerConfig};
use crate::shutdown::{StopListener, StopSignal};
use crate::tracker::{
    LabelCriteria, ProcessSource, ProcessTracker, SysinfoProcessSource, TrackerError,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Startup failures that need operator action
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("no running process named {0:?}")]
    TargetNotFound(String),
    #[error(transparent)]
    Listing(#[from] TrackerError),
}

/// Builder for the profiler engine
pub struct ProfilerBuilder {
    capture: CaptureConfig,
    samplers: HashMap<MetricKind, SamplerConfig>,
    history_capacity: usize,
    gpu_enabled: bool,
    criteria: LabelCriteria,
    source: Option<Arc<dyn ProcessSource>>,
    probe: Option<Arc<dyn HostProbe>>,
    backends: HashMap<MetricKind, Arc<dyn CounterBackend>>,
    health: Option<HealthRegistry>,
}

impl ProfilerBuilder {
    pub fn new() -> Self {
        Self {
            capture: CaptureConfig::default(),
            samplers: HashMap::new(),
            history_capacity: DEFAULT_CAPACITY,
            gpu_enabled: true,
            criteria: LabelCriteria::default(),
            source: None,
            probe: None,
            backends: HashMap::new(),
            health: None,
        }
    }

    /// Set the process name to follow
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.capture.target = target.into();
        self
    }

    /// Set the capture loop configuration; its target is kept if already set
    pub fn capture_config(mut self, config: CaptureConfig) -> Self {
        let target = std::mem::take(&mut self.capture.target);
        self.capture = config;
        if self.capture.target.is_empty() {
            self.capture.target = target;
        }
        self
    }

    pub fn sampler_config(mut self, kind: MetricKind, config: SamplerConfig) -> Self {
        self.samplers.insert(kind, config);
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }

    pub fn label_criteria(mut self, criteria: LabelCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Override the process listing (default: `sysinfo`)
    pub fn process_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the one-shot host queries (default: `sysinfo`)
    pub fn host_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Override the counter backend of one sampler
    pub fn backend(mut self, kind: MetricKind, backend: Arc<dyn CounterBackend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the engine without starting it
    pub fn build(mut self) -> Result<Profiler> {
        if self.capture.target.trim().is_empty() {
            anyhow::bail!("Target process name is required");
        }

        let target = self.capture.target.clone();
        let tracker = Arc::new(ProcessTracker::new(target.clone(), self.criteria));
        let history = Arc::new(RwLock::new(History::new(self.history_capacity)));
        let health = self.health.unwrap_or_default();

        let kinds: Vec<MetricKind> = MetricKind::ALL
            .into_iter()
            .filter(|kind| *kind != MetricKind::Gpu || self.gpu_enabled)
            .collect();

        let mut samplers = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let config = self.samplers.remove(kind).unwrap_or_default();
            let backend = self
                .backends
                .remove(kind)
                .unwrap_or_else(|| create_backend(*kind));
            samplers.push(
                MetricSampler::new(*kind, config, backend, Arc::clone(&tracker))
                    .with_health(health.clone()),
            );
        }

        let cache_of = |kind: MetricKind| {
            samplers
                .iter()
                .find(|s| s.kind() == kind)
                .map(|s| s.cache())
        };
        let caches = SamplerCaches {
            cpu: cache_of(MetricKind::Cpu)
                .ok_or_else(|| anyhow::anyhow!("CPU sampler is required"))?,
            gpu: cache_of(MetricKind::Gpu),
            memory: cache_of(MetricKind::Memory)
                .ok_or_else(|| anyhow::anyhow!("Memory sampler is required"))?,
            virtual_size: cache_of(MetricKind::VirtualSize)
                .ok_or_else(|| anyhow::anyhow!("Virtual size sampler is required"))?,
        };

        let source = self
            .source
            .unwrap_or_else(|| Arc::new(SysinfoProcessSource::new()));
        let probe = self.probe.unwrap_or_else(|| Arc::new(SysinfoProbe::new()));
        let control = CaptureControl::new();

        let orchestrator = CaptureOrchestrator::new(
            self.capture,
            Arc::clone(&source),
            Arc::clone(&tracker),
            probe,
            caches,
            Arc::clone(&history),
        )
        .with_health(health.clone())
        .with_control(control.clone());

        Ok(Profiler {
            target,
            kinds,
            source,
            tracker,
            history,
            control,
            samplers,
            orchestrator,
            health,
        })
    }
}

impl Default for ProfilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An assembled engine, not yet running
pub struct Profiler {
    target: String,
    kinds: Vec<MetricKind>,
    source: Arc<dyn ProcessSource>,
    tracker: Arc<ProcessTracker>,
    history: Arc<RwLock<History>>,
    control: CaptureControl,
    samplers: Vec<MetricSampler>,
    orchestrator: CaptureOrchestrator,
    health: HealthRegistry,
}

impl Profiler {
    pub fn builder() -> ProfilerBuilder {
        ProfilerBuilder::new()
    }

    /// Query handle, usable before and after start
    pub fn handle(&self) -> ProfilerHandle {
        ProfilerHandle::new(
            Arc::clone(&self.tracker),
            Arc::clone(&self.history),
            self.control.clone(),
        )
    }

    /// Metric families this engine samples
    pub fn metric_kinds(&self) -> &[MetricKind] {
        &self.kinds
    }

    /// Locate the target and spawn every loop
    ///
    /// Fails when no process with the target name is running or processes
    /// cannot be listed at all. Once started, the tracked set may become
    /// empty without stopping the engine.
    pub async fn start(self) -> Result<RunningProfiler, ProfilerError> {
        let listed = self.source.list(&self.target).await?;
        if listed.is_empty() {
            return Err(ProfilerError::TargetNotFound(self.target));
        }
        self.tracker.reconcile(&listed).await;
        self.health.register_engine(&self.kinds).await;

        let handle = self.handle();
        let logger = StructuredLogger::new(self.target.clone());
        let signal = StopSignal::new();
        let mut tasks = Vec::with_capacity(self.samplers.len() + 2);

        tasks.push(tokio::spawn(log_process_changes(
            Arc::clone(&self.tracker),
            logger.clone(),
            signal.listener(),
        )));
        for sampler in self.samplers {
            tasks.push(tokio::spawn(sampler.run(signal.listener())));
        }
        tasks.push(tokio::spawn(self.orchestrator.run(signal.listener())));

        logger.log_startup(env!("CARGO_PKG_VERSION"), listed.len());

        Ok(RunningProfiler {
            signal,
            tasks,
            handle,
            logger,
        })
    }
}

async fn log_process_changes(
    tracker: Arc<ProcessTracker>,
    logger: StructuredLogger,
    mut stop: StopListener,
) {
    let mut changes = tracker.subscribe();
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(diff) => logger.log_process_change(&diff.added, &diff.removed),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Process change notifications lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = stop.stopped() => break,
        }
    }
}

/// A started engine
pub struct RunningProfiler {
    signal: StopSignal,
    tasks: Vec<JoinHandle<()>>,
    handle: ProfilerHandle,
    logger: StructuredLogger,
}

impl RunningProfiler {
    pub fn handle(&self) -> ProfilerHandle {
        self.handle.clone()
    }

    /// Ask every loop to stop at its next iteration boundary
    pub fn notify_stop(&self) {
        self.signal.notify_stop();
    }

    /// Wait for every loop to finish
    pub async fn wait_all(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Profiler task ended abnormally");
            }
        }
        info!("All profiler loops stopped");
    }

    /// Stop and join every loop
    pub async fn shutdown(self, reason: &str) {
        self.logger.log_shutdown(reason);
        self.notify_stop();
        self.wait_all().await;
    }
}
