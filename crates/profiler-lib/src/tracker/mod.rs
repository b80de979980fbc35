//! Process discovery and tracking
//!
//! This module lists the OS processes matching the configured target name,
//! labels them from their command lines and keeps the tracked set in sync
//! across reloads.

mod labels;
mod registry;

pub use labels::{LabelCriteria, LabelCriterion, DEFAULT_LABEL};
pub use registry::{diff, ProcessTracker, TrackedProcess, TrackerDiff};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

/// Errors from listing processes
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The OS refused to enumerate processes at all
    #[error("process listing denied: {0}")]
    ListingDenied(String),
    #[error("process listing failed: {0}")]
    Listing(String),
}

/// A process as returned by one listing pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedProcess {
    pub pid: u32,
    pub name: String,
    /// Space-joined command line; `None` when it could not be read
    pub cmdline: Option<String>,
}

/// Trait for process enumeration implementations
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// List every live process whose name equals `name`
    async fn list(&self, name: &str) -> Result<Vec<ListedProcess>, TrackerError>;
}

/// Process source backed by the `sysinfo` process table
pub struct SysinfoProcessSource {
    system: Arc<Mutex<System>>,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn list_blocking(system: &Mutex<System>, name: &str) -> Result<Vec<ListedProcess>, TrackerError> {
        let mut sys = system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        if sys.processes().is_empty() {
            return Err(TrackerError::ListingDenied(
                "no processes visible to this user".to_string(),
            ));
        }

        let mut listed: Vec<ListedProcess> = sys
            .processes()
            .iter()
            .filter(|(_, process)| process.name() == name)
            .map(|(pid, process)| {
                let cmd = process.cmd();
                let cmdline = if cmd.is_empty() {
                    None
                } else {
                    Some(
                        cmd.iter()
                            .map(|part| part.to_string_lossy())
                            .collect::<Vec<_>>()
                            .join(" "),
                    )
                };
                ListedProcess {
                    pid: pid.as_u32(),
                    name: name.to_string(),
                    cmdline,
                }
            })
            .collect();

        // HashMap iteration order is arbitrary; keep listings stable
        listed.sort_by_key(|p| p.pid);
        Ok(listed)
    }
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSource for SysinfoProcessSource {
    async fn list(&self, name: &str) -> Result<Vec<ListedProcess>, TrackerError> {
        let system = Arc::clone(&self.system);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || Self::list_blocking(&system, &name))
            .await
            .map_err(|e| TrackerError::Listing(e.to_string()))?
    }
}
