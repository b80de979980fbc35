//! Metric sampler loop
//!
//! One sampler per metric family. A cycle lists the backend instances for
//! the tracked pids, reuses cached counter handles (registering new ones
//! with a discarded baseline collection), sums instance values per pid,
//! smooths them and publishes into the shared [`SampleCache`].

use super::{
    CounterBackend, CounterCacheEntry, CounterError, CounterInstance, HandleCache, MetricKind,
    SampleCache, SampleWindow,
};
use crate::health::{components, HealthRegistry};
use crate::observability::ProfilerMetrics;
use crate::shutdown::StopListener;
use crate::tracker::ProcessTracker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Consecutive backend-unavailable cycles before a sampler is reported
/// unhealthy rather than degraded
pub const UNHEALTHY_AFTER: u32 = 5;

/// Configuration for one sampler loop
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Target period between cycle starts (default: 1 second)
    pub period: Duration,
    /// Lower bound on the sleep between cycles (default: 100 ms)
    pub min_sleep: Duration,
    /// Number of raw samples averaged per pid (default: 1, no smoothing)
    pub window: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            min_sleep: Duration::from_millis(100),
            window: 1,
        }
    }
}

impl SamplerConfig {
    /// Sleep after a cycle that took `elapsed`
    ///
    /// Slow cycles shrink the sleep but never below `min_sleep`.
    pub fn next_sleep(&self, elapsed: Duration) -> Duration {
        self.period.saturating_sub(elapsed).max(self.min_sleep)
    }
}

/// Result of one sampler cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerCycle {
    /// Values were published for `published` pids; `failed` pids kept their
    /// previous value
    Sampled { published: usize, failed: usize },
    /// The backend was unavailable; the handle cache was reset and every
    /// published value left in place
    BackendUnavailable,
}

/// Background sampler for one metric family
pub struct MetricSampler {
    kind: MetricKind,
    config: SamplerConfig,
    backend: Arc<dyn CounterBackend>,
    tracker: Arc<ProcessTracker>,
    cache: SampleCache,
    handles: HandleCache,
    windows: HashMap<u32, SampleWindow>,
    cycle: u64,
    health: Option<HealthRegistry>,
    metrics: ProfilerMetrics,
    degraded: bool,
    unavailable_streak: u32,
}

impl MetricSampler {
    /// Create a sampler publishing into a fresh cache
    pub fn new(
        kind: MetricKind,
        config: SamplerConfig,
        backend: Arc<dyn CounterBackend>,
        tracker: Arc<ProcessTracker>,
    ) -> Self {
        Self {
            kind,
            config,
            backend,
            tracker,
            cache: SampleCache::new(kind),
            handles: HandleCache::new(),
            windows: HashMap::new(),
            cycle: 0,
            health: None,
            metrics: ProfilerMetrics::new(),
            degraded: false,
            unavailable_streak: 0,
        }
    }

    /// Report backend availability to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Reader handle onto the values this sampler publishes
    pub fn cache(&self) -> SampleCache {
        self.cache.clone()
    }

    /// Live handle registrations
    pub fn handles(&self) -> &HandleCache {
        &self.handles
    }

    /// Run the sampler until a stop is requested
    pub async fn run(mut self, mut stop: StopListener) {
        info!(
            metric = %self.kind,
            period_ms = self.config.period.as_millis() as u64,
            window = self.config.window,
            "Starting metric sampler"
        );

        while !stop.should_stop() {
            let start = Instant::now();

            let pids = self.tracker.pids().await;
            let outcome = self.sample(&pids).await;

            let elapsed = start.elapsed();
            self.metrics
                .observe_sampler_latency(self.kind, elapsed.as_secs_f64());
            self.report(&outcome).await;

            stop.sleep(self.config.next_sleep(elapsed)).await;
        }

        info!(metric = %self.kind, cycles = self.cycle, "Metric sampler stopped");
    }

    /// Run one sampling cycle for `pids`
    pub async fn sample(&mut self, pids: &[u32]) -> SamplerCycle {
        self.cycle += 1;

        let tracked: HashSet<u32> = pids.iter().copied().collect();
        let evicted = self.handles.retain_pids(&tracked);
        self.windows.retain(|pid, _| tracked.contains(pid));
        if evicted > 0 {
            debug!(metric = %self.kind, evicted, "Dropped handles for vanished processes");
        }

        if tracked.is_empty() {
            return SamplerCycle::Sampled {
                published: 0,
                failed: 0,
            };
        }

        let instances = match self.backend.instances(pids).await {
            Ok(instances) => instances,
            Err(e) => return self.reset_backend(&e).await,
        };

        let mut totals: HashMap<u32, f64> = HashMap::new();
        let mut failed: HashSet<u32> = HashSet::new();

        for instance in instances.iter().filter(|i| tracked.contains(&i.pid)) {
            if failed.contains(&instance.pid) {
                continue;
            }

            let cached = self.handles.get(&instance.key).map(|entry| entry.handle);
            let reading = match cached {
                Some(handle) => self.backend.collect(handle).await,
                None => self.register(instance).await,
            };

            match reading {
                Ok(value) => *totals.entry(instance.pid).or_insert(0.0) += value,
                Err(e) if e.is_backend_failure() => return self.reset_backend(&e).await,
                Err(e) => {
                    debug!(
                        metric = %self.kind,
                        pid = instance.pid,
                        instance = %instance.key,
                        error = %e,
                        "Counter query failed, keeping previous value"
                    );
                    failed.insert(instance.pid);
                }
            }
        }

        // A pid with a failed instance keeps its last value instead of a partial sum
        totals.retain(|pid, _| !failed.contains(pid));

        let window_size = self.config.window;
        for (pid, total) in &totals {
            let smoothed = self
                .windows
                .entry(*pid)
                .or_insert_with(|| SampleWindow::new(window_size))
                .push(*total);
            self.cache.publish(*pid, smoothed);
        }

        if !failed.is_empty() {
            self.metrics
                .add_sampler_errors(self.kind, failed.len() as u64);
        }

        SamplerCycle::Sampled {
            published: totals.len(),
            failed: failed.len(),
        }
    }

    /// Register a handle for `instance` and return its first usable value
    ///
    /// The first collection after registration only establishes the
    /// counter's baseline and is discarded.
    async fn register(&mut self, instance: &CounterInstance) -> Result<f64, CounterError> {
        let handle = self.backend.register(instance).await?;
        self.handles.insert(CounterCacheEntry {
            key: instance.key.clone(),
            pid: instance.pid,
            handle,
            created_at_cycle: self.cycle,
        });
        debug!(
            metric = %self.kind,
            pid = instance.pid,
            instance = %instance.key,
            "Registered counter handle"
        );

        self.backend.collect(handle).await?;
        self.backend.collect(handle).await
    }

    async fn reset_backend(&mut self, error: &CounterError) -> SamplerCycle {
        let dropped = self.handles.reset();
        self.backend.release_all().await;
        warn!(
            metric = %self.kind,
            error = %error,
            dropped_handles = dropped,
            "Counter backend unavailable, handle cache reset"
        );
        self.metrics.add_sampler_errors(self.kind, 1);
        SamplerCycle::BackendUnavailable
    }

    /// Publish the cycle outcome to the health registry
    pub(crate) async fn report(&mut self, outcome: &SamplerCycle) {
        match outcome {
            SamplerCycle::BackendUnavailable => self.unavailable_streak += 1,
            SamplerCycle::Sampled { .. } => self.unavailable_streak = 0,
        }

        let Some(health) = &self.health else {
            return;
        };
        let component = components::sampler(self.kind);

        match outcome {
            SamplerCycle::BackendUnavailable if self.unavailable_streak == UNHEALTHY_AFTER => {
                error!(
                    metric = %self.kind,
                    cycles = self.unavailable_streak,
                    "Counter backend still unavailable"
                );
                health
                    .set_unhealthy(component, "counter backend unavailable")
                    .await;
                self.degraded = true;
            }
            SamplerCycle::BackendUnavailable if !self.degraded => {
                health
                    .set_degraded(component, "counter backend unavailable")
                    .await;
                self.degraded = true;
            }
            SamplerCycle::Sampled { .. } if self.degraded => {
                info!(metric = %self.kind, "Counter backend recovered");
                health.set_healthy(component).await;
                self.degraded = false;
            }
            _ => {}
        }
    }
}
