//! Tracked process set and incremental reconciliation
//!
//! The tracker keeps an arena of tracked processes indexed by pid. Each
//! reload is diffed against the arena so that processes which survive keep
//! the same `Arc` (and samplers keep their counter handles warm) instead of
//! being rebuilt from scratch.

use super::{LabelCriteria, ListedProcess};
use crate::models::ProcessSummary;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Capacity of the process-change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// A process currently being tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    pub name: String,
    /// `None` until the command line could be read
    pub label: Option<String>,
}

impl TrackedProcess {
    fn from_listed(listed: &ListedProcess, criteria: &LabelCriteria) -> Self {
        Self {
            pid: listed.pid,
            name: listed.name.clone(),
            label: listed.cmdline.as_deref().map(|cmd| criteria.classify(cmd)),
        }
    }
}

/// Pids that entered and left the tracked set in one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerDiff {
    pub added: Vec<u32>,
    pub removed: Vec<u32>,
}

impl TrackerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff `current` against a freshly listed process set
///
/// Returns the diff and the resulting set, built as
/// `added ++ (current - removed)`. Surviving processes keep their `Arc`
/// unless they were unlabelled and a command line is now readable.
pub fn diff(
    current: &[Arc<TrackedProcess>],
    listed: &[ListedProcess],
    criteria: &LabelCriteria,
) -> (TrackerDiff, Vec<Arc<TrackedProcess>>) {
    let mut listed_by_pid: HashMap<u32, &ListedProcess> = HashMap::with_capacity(listed.len());
    let mut listed_order: Vec<u32> = Vec::with_capacity(listed.len());
    for process in listed {
        if listed_by_pid.insert(process.pid, process).is_none() {
            listed_order.push(process.pid);
        }
    }

    let current_pids: HashSet<u32> = current.iter().map(|p| p.pid).collect();

    let removed: Vec<u32> = current
        .iter()
        .map(|p| p.pid)
        .filter(|pid| !listed_by_pid.contains_key(pid))
        .collect();

    let added: Vec<Arc<TrackedProcess>> = listed_order
        .iter()
        .filter(|pid| !current_pids.contains(pid))
        .map(|pid| Arc::new(TrackedProcess::from_listed(listed_by_pid[pid], criteria)))
        .collect();

    let mut resulting = Vec::with_capacity(added.len() + current.len() - removed.len());
    resulting.extend(added.iter().cloned());

    for process in current {
        let Some(entry) = listed_by_pid.get(&process.pid) else {
            continue;
        };
        if process.label.is_none() && entry.cmdline.is_some() {
            resulting.push(Arc::new(TrackedProcess::from_listed(entry, criteria)));
        } else {
            resulting.push(Arc::clone(process));
        }
    }

    let diff = TrackerDiff {
        added: added.iter().map(|p| p.pid).collect(),
        removed,
    };

    (diff, resulting)
}

#[derive(Debug, Default)]
struct TrackedSet {
    order: Vec<Arc<TrackedProcess>>,
    by_pid: HashMap<u32, Arc<TrackedProcess>>,
}

impl TrackedSet {
    fn replace(&mut self, processes: Vec<Arc<TrackedProcess>>) {
        self.by_pid = processes.iter().map(|p| (p.pid, Arc::clone(p))).collect();
        self.order = processes;
    }

    fn needs_labels(&self) -> bool {
        self.order.iter().any(|p| p.label.is_none())
    }
}

/// Registry of processes matching the configured target name
pub struct ProcessTracker {
    target: String,
    criteria: LabelCriteria,
    processes: RwLock<TrackedSet>,
    changes: broadcast::Sender<TrackerDiff>,
}

impl ProcessTracker {
    /// Create an empty tracker for `target`
    pub fn new(target: impl Into<String>, criteria: LabelCriteria) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            target: target.into(),
            criteria,
            processes: RwLock::new(TrackedSet::default()),
            changes,
        }
    }

    /// Target process name this tracker follows
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Reconcile the tracked set with a fresh listing
    ///
    /// An unchanged pid set with every process already labelled
    /// short-circuits without touching the arena.
    pub async fn reconcile(&self, listed: &[ListedProcess]) -> TrackerDiff {
        let mut set = self.processes.write().await;

        let listed_pids: HashSet<u32> = listed.iter().map(|p| p.pid).collect();
        let unchanged = listed_pids.len() == set.by_pid.len()
            && listed_pids.iter().all(|pid| set.by_pid.contains_key(pid));
        if unchanged && !set.needs_labels() {
            return TrackerDiff::default();
        }

        let (diff, resulting) = diff(&set.order, listed, &self.criteria);
        set.replace(resulting);
        drop(set);

        if !diff.is_empty() {
            debug!(
                target_name = %self.target,
                added = ?diff.added,
                removed = ?diff.removed,
                "Tracked process set changed"
            );
            // No receivers is fine
            let _ = self.changes.send(diff.clone());
        }

        diff
    }

    /// Subscribe to non-empty diffs produced by [`reconcile`](Self::reconcile)
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerDiff> {
        self.changes.subscribe()
    }

    /// Current tracked processes in tracking order
    pub async fn snapshot(&self) -> Vec<Arc<TrackedProcess>> {
        self.processes.read().await.order.clone()
    }

    /// Current tracked pids in tracking order
    pub async fn pids(&self) -> Vec<u32> {
        self.processes.read().await.order.iter().map(|p| p.pid).collect()
    }

    /// Label assigned to `pid`, if tracked and labelled
    pub async fn label_of(&self, pid: u32) -> Option<String> {
        self.processes
            .read()
            .await
            .by_pid
            .get(&pid)
            .and_then(|p| p.label.clone())
    }

    pub async fn contains(&self, pid: u32) -> bool {
        self.processes.read().await.by_pid.contains_key(&pid)
    }

    pub async fn len(&self) -> usize {
        self.processes.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.order.is_empty()
    }

    /// Labels currently assigned to at least one process
    pub async fn labels_in_use(&self) -> Vec<String> {
        let set = self.processes.read().await;
        let mut labels: Vec<String> = Vec::new();
        for label in set.order.iter().filter_map(|p| p.label.as_ref()) {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }

    /// Number of tracked processes carrying `label`
    pub async fn count_label(&self, label: &str) -> usize {
        self.processes
            .read()
            .await
            .order
            .iter()
            .filter(|p| p.label.as_deref() == Some(label))
            .count()
    }

    /// Tracked processes in the shape query consumers expect
    pub async fn summaries(&self) -> Vec<ProcessSummary> {
        self.processes
            .read()
            .await
            .order
            .iter()
            .map(|p| ProcessSummary {
                pid: p.pid,
                name: p.name.clone(),
                label: p.label.clone(),
            })
            .collect()
    }
}
