//! Core data models for the profiler engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Label attached to the aggregate-across-tracked-processes record
pub const AGGREGATE_LABEL: &str = "total";

/// Label attached to the whole-machine record
pub const SYSTEM_LABEL: &str = "system";

/// Which process a record describes
///
/// Aggregates are explicit variants instead of reserved pids so they can
/// never collide with a real process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pid", rename_all = "snake_case")]
pub enum ProcessKind {
    /// A real, tracked OS process
    Tracked(u32),
    /// Sum over every tracked process in a capture cycle
    AggregateTotal,
    /// Whole machine, including load outside the tracked set
    WholeSystem,
}

impl ProcessKind {
    /// Pid of a tracked process, `None` for synthesized records
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessKind::Tracked(pid) => Some(*pid),
            _ => None,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        !matches!(self, ProcessKind::Tracked(_))
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Tracked(pid) => write!(f, "{}", pid),
            ProcessKind::AggregateTotal => f.write_str(AGGREGATE_LABEL),
            ProcessKind::WholeSystem => f.write_str(SYSTEM_LABEL),
        }
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            AGGREGATE_LABEL => Ok(ProcessKind::AggregateTotal),
            SYSTEM_LABEL => Ok(ProcessKind::WholeSystem),
            other => other.parse().map(ProcessKind::Tracked),
        }
    }
}

/// Identity of the process a record was captured for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub kind: ProcessKind,
    /// Configured target process name
    pub target_name: String,
    /// Semantic label; `None` while the command line could not be read
    pub label: Option<String>,
}

impl ProcessIdentity {
    pub fn tracked(pid: u32, target_name: impl Into<String>, label: Option<String>) -> Self {
        Self {
            kind: ProcessKind::Tracked(pid),
            target_name: target_name.into(),
            label,
        }
    }

    pub fn aggregate(target_name: impl Into<String>) -> Self {
        Self {
            kind: ProcessKind::AggregateTotal,
            target_name: target_name.into(),
            label: Some(AGGREGATE_LABEL.to_string()),
        }
    }

    pub fn whole_system(target_name: impl Into<String>) -> Self {
        Self {
            kind: ProcessKind::WholeSystem,
            target_name: target_name.into(),
            label: Some(SYSTEM_LABEL.to_string()),
        }
    }
}

/// Memory figures for one process (or an aggregate), all in megabytes
///
/// Metrics a platform cannot provide are 0, never missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUtilization {
    pub system_total_mb: f64,
    pub system_free_mb: f64,
    /// Unique set size
    pub uss_mb: f64,
    /// Resident set size
    pub rss_mb: f64,
    /// Virtual memory size
    pub vms_mb: f64,
    /// Working set
    pub wset_mb: f64,
    /// Private working set
    pub pwset_mb: f64,
    /// Figure reported by the external counter subsystem (task-manager equivalent)
    pub external_mb: f64,
    pub virtual_size_mb: f64,
}

impl MemoryUtilization {
    /// Add the per-process fields of `other` into `self`
    ///
    /// System-wide fields are left untouched; they describe the machine,
    /// not the process.
    pub fn accumulate(&mut self, other: &MemoryUtilization) {
        self.uss_mb += other.uss_mb;
        self.rss_mb += other.rss_mb;
        self.vms_mb += other.vms_mb;
        self.wset_mb += other.wset_mb;
        self.pwset_mb += other.pwset_mb;
        self.external_mb += other.external_mb;
        self.virtual_size_mb += other.virtual_size_mb;
    }
}

/// One captured sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Unix epoch seconds
    pub timestamp: i64,
    pub process: ProcessIdentity,
    pub memory: MemoryUtilization,
    /// Percent of one core; exceeds 100 for multi-core load
    pub cpu_percent: f64,
    pub gpu_percent: f64,
}

/// Inclusive time window in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// A tracked process as reported to query consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: String,
    pub label: Option<String>,
}
