//! Profiler configuration

use anyhow::{bail, Context, Result};
use profiler_lib::history::codec::DELIMITER;
use profiler_lib::{CaptureConfig, LabelCriteria, LabelCriterion, MetricKind, SamplerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Profiler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    /// Process name to follow
    #[serde(default = "default_target")]
    pub target: String,

    /// Capture loop period in milliseconds
    #[serde(default = "default_capture_period")]
    pub capture_period_ms: u64,

    #[serde(default = "default_sampler_period")]
    pub cpu_period_ms: u64,

    #[serde(default = "default_sampler_period")]
    pub gpu_period_ms: u64,

    #[serde(default = "default_sampler_period")]
    pub memory_period_ms: u64,

    #[serde(default = "default_vsize_period")]
    pub vsize_period_ms: u64,

    /// Floor for every loop's sleep between cycles, in milliseconds
    #[serde(default = "default_min_sleep")]
    pub min_sleep_ms: u64,

    /// Raw CPU samples averaged per process
    #[serde(default = "default_cpu_smoothing_window")]
    pub cpu_smoothing_window: usize,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_true")]
    pub gpu_enabled: bool,

    /// Record only aggregates, no per-process rows
    #[serde(default)]
    pub totals_only: bool,

    /// Add a whole-machine record to every capture
    #[serde(default = "default_true")]
    pub system_record: bool,

    /// Append every capture to `log_dir/history-<target>.csv`
    #[serde(default)]
    pub persist: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Ordered (keyword, label) rules
    #[serde(default)]
    pub label_criteria: Vec<LabelCriterion>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_target() -> String {
    std::env::var("PROFILER_TARGET").unwrap_or_default()
}

fn default_capture_period() -> u64 {
    1000
}

fn default_sampler_period() -> u64 {
    1000
}

fn default_vsize_period() -> u64 {
    5000
}

fn default_min_sleep() -> u64 {
    100
}

fn default_cpu_smoothing_window() -> usize {
    3
}

fn default_history_capacity() -> usize {
    profiler_lib::history::DEFAULT_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_api_port() -> u16 {
    8080
}

impl ProfilerConfig {
    /// Load configuration from an optional `config` file and the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("PROFILER"))
            .build()
            .context("Failed to read profiler configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid profiler configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would corrupt history rows
    pub fn validate(&self) -> Result<()> {
        if self.target.contains(DELIMITER) {
            bail!("Target name {:?} must not contain {:?}", self.target, DELIMITER);
        }
        for criterion in &self.label_criteria {
            if criterion.label.contains(DELIMITER) {
                bail!(
                    "Label {:?} for keyword {:?} must not contain {:?}",
                    criterion.label,
                    criterion.keyword,
                    DELIMITER
                );
            }
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            target: self.target.clone(),
            period: Duration::from_millis(self.capture_period_ms),
            min_sleep: Duration::from_millis(self.min_sleep_ms),
            totals_only: self.totals_only,
            system_record: self.system_record,
            persist: self.persist,
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn sampler_config(&self, kind: MetricKind) -> SamplerConfig {
        let (period_ms, window) = match kind {
            MetricKind::Cpu => (self.cpu_period_ms, self.cpu_smoothing_window),
            MetricKind::Gpu => (self.gpu_period_ms, 1),
            MetricKind::Memory => (self.memory_period_ms, 1),
            MetricKind::VirtualSize => (self.vsize_period_ms, 1),
        };
        SamplerConfig {
            period: Duration::from_millis(period_ms),
            min_sleep: Duration::from_millis(self.min_sleep_ms),
            window: window.max(1),
        }
    }

    pub fn label_criteria(&self) -> LabelCriteria {
        LabelCriteria::new(self.label_criteria.clone())
    }
}
