//! Capture orchestration
//!
//! The capture loop turns sampler caches and one-shot host queries into
//! history records, and optionally mirrors every cycle to an append-only
//! log file.

mod orchestrator;
mod persist;
mod probe;

#[cfg(test)]
mod tests;

pub use orchestrator::{
    CaptureConfig, CaptureControl, CaptureOrchestrator, CycleOutcome, SamplerCaches,
};
pub use persist::{log_file_name, AppendLog};
pub use probe::{HostProbe, ProbeError, SysinfoProbe, SystemSnapshot};
