//! Process profiler engine
//!
//! This crate provides the core functionality for:
//! - Tracking and labelling every process with a given name
//! - Independent CPU, GPU, memory and virtual-size samplers with counter handle caching
//! - A capture loop building per-process and aggregate records
//! - A bounded, versioned history with a flat text format
//! - Health checks and observability

pub mod capture;
pub mod health;
pub mod history;
pub mod models;
pub mod observability;
pub mod profiler;
pub mod query;
pub mod sampler;
pub mod shutdown;
pub mod tracker;

pub use capture::{CaptureConfig, CaptureControl, CycleOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use history::{History, HistoryStats, ImportReport};
pub use models::*;
pub use observability::{ProfilerMetrics, StructuredLogger};
pub use profiler::{Profiler, ProfilerBuilder, ProfilerError, RunningProfiler};
pub use query::{HistoryPage, ProfilerHandle};
pub use sampler::{MetricKind, SamplerConfig};
pub use shutdown::{StopListener, StopSignal};
pub use tracker::{LabelCriteria, LabelCriterion};
