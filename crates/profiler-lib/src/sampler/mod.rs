//! Independent metric samplers
//!
//! Each sampler runs its own loop at its own period, queries an external
//! counter backend for the tracked pid set and republishes the results into
//! a pid -> value cache that the capture loop reads without waiting.

mod backends;
mod cache;
mod handles;
mod r#loop;


pub use backends::{create_backend, CounterField, EmptyCounters, SysinfoCounters};
pub use cache::{SampleCache, SampleWindow};
pub use handles::{CounterCacheEntry, HandleCache};
pub use r#loop::{MetricSampler, SamplerConfig, SamplerCycle, UNHEALTHY_AFTER};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Metric family a sampler is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Gpu,
    Memory,
    VirtualSize,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Gpu,
        MetricKind::Memory,
        MetricKind::VirtualSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Gpu => "gpu",
            MetricKind::Memory => "memory",
            MetricKind::VirtualSize => "vsize",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a counter backend
#[derive(Debug, Clone, Error)]
pub enum CounterError {
    /// The counter subsystem itself is down or answered with a protocol error
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),
    /// The instance disappeared (process exited)
    #[error("counter instance {0} is gone")]
    InstanceGone(String),
    #[error("counter query for {instance} failed: {message}")]
    Query { instance: String, message: String },
}

impl CounterError {
    /// Whether the failure concerns the whole backend rather than one instance
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, CounterError::Unavailable(_))
    }
}

/// Opaque registration with a counter backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle(pub u64);

/// One countable object exposed by a backend
///
/// A pid may own several instances (one per GPU engine queue, for example).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterInstance {
    /// Backend-assigned instance identifier, the handle cache key
    pub key: String,
    pub pid: u32,
}

impl CounterInstance {
    /// Instance keyed directly by pid
    pub fn for_pid(pid: u32) -> Self {
        Self {
            key: pid.to_string(),
            pid,
        }
    }

    /// Instance from an engine-style identifier such as
    /// `pid_1234_luid_0x0_0xD1A2_phys_0_eng_0_engtype_3D`
    pub fn from_engine_name(name: impl Into<String>) -> Option<Self> {
        let key = name.into();
        let pid = parse_engine_pid(&key)?;
        Some(Self { key, pid })
    }
}

/// Extract the pid embedded in an engine instance identifier
pub fn parse_engine_pid(name: &str) -> Option<u32> {
    let rest = &name[name.find("pid_")? + 4..];
    let digits: &str = rest
        .find(|c: char| !c.is_ascii_digit())
        .map(|end| &rest[..end])
        .unwrap_or(rest);
    digits.parse().ok()
}

/// Trait for external performance-counter subsystems
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// List the instances of this counter object, restricted to `pids`
    /// when the backend is able to filter
    async fn instances(&self, pids: &[u32]) -> Result<Vec<CounterInstance>, CounterError>;

    /// Register a counter for `instance`
    async fn register(&self, instance: &CounterInstance) -> Result<CounterHandle, CounterError>;

    /// Collect a fresh reading and return its formatted value
    async fn collect(&self, handle: CounterHandle) -> Result<f64, CounterError>;

    /// Drop every registration this backend handed out
    async fn release_all(&self) {}
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn test_parse_engine_pid() {
        assert_eq!(
            parse_engine_pid("pid_1234_luid_0x00000000_0x0000D1A2_phys_0_eng_0_engtype_3D"),
            Some(1234)
        );
        assert_eq!(parse_engine_pid("pid_77"), Some(77));
        assert_eq!(parse_engine_pid("luid_0x0_eng_0"), None);
        assert_eq!(parse_engine_pid("pid__x"), None);
    }

    #[test]
    fn test_instance_constructors() {
        let instance = CounterInstance::from_engine_name("pid_42_eng_1_engtype_Copy").unwrap();
        assert_eq!(instance.pid, 42);
        assert_eq!(instance.key, "pid_42_eng_1_engtype_Copy");

        assert_eq!(CounterInstance::for_pid(9).key, "9");
    }

    #[test]
    fn test_backend_failure_classification() {
        assert!(CounterError::Unavailable("down".into()).is_backend_failure());
        assert!(!CounterError::InstanceGone("1".into()).is_backend_failure());
    }
}
