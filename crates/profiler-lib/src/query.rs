//! Query surface for dashboard and API consumers
//!
//! A cheap, cloneable handle onto the running engine. Transport is left to
//! the caller; every operation here is a plain async method.

use crate::capture::CaptureControl;
use crate::history::{History, HistoryStats, ImportReport};
use crate::models::{HistoryRecord, ProcessKind, ProcessSummary, TimeWindow};
use crate::observability::{ProfilerMetrics, StructuredLogger};
use crate::tracker::ProcessTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One incremental history poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    /// Set when the caller's version was stale; `records` then starts at 0
    pub version: Option<u64>,
    /// Offset to pass on the next poll
    pub next_offset: u64,
}

#[derive(Clone)]
pub struct ProfilerHandle {
    tracker: Arc<ProcessTracker>,
    history: Arc<RwLock<History>>,
    control: CaptureControl,
    logger: StructuredLogger,
    metrics: ProfilerMetrics,
}

impl ProfilerHandle {
    pub fn new(
        tracker: Arc<ProcessTracker>,
        history: Arc<RwLock<History>>,
        control: CaptureControl,
    ) -> Self {
        let logger = StructuredLogger::new(tracker.target().to_string());
        Self {
            tracker,
            history,
            control,
            logger,
            metrics: ProfilerMetrics::new(),
        }
    }

    /// Records from `offset` on, or everything plus the new version when
    /// `known_version` is stale
    pub async fn get_history(&self, offset: u64, known_version: u64) -> HistoryPage {
        let history = self.history.read().await;
        let current = history.version();

        if known_version != current {
            HistoryPage {
                records: history.offset_from(0),
                version: Some(current),
                next_offset: history.next_offset(),
            }
        } else {
            HistoryPage {
                records: history.offset_from(offset),
                version: None,
                next_offset: history.next_offset(),
            }
        }
    }

    pub async fn latest(&self, n: usize, process: Option<ProcessKind>) -> Vec<HistoryRecord> {
        self.history.read().await.latest(n, process)
    }

    pub async fn range(
        &self,
        window: TimeWindow,
        process: Option<ProcessKind>,
    ) -> Vec<HistoryRecord> {
        self.history.read().await.range(window, process)
    }

    pub async fn history_stats(&self) -> HistoryStats {
        self.history.read().await.stats()
    }

    /// Currently tracked processes with their labels
    pub async fn get_processes(&self) -> Vec<ProcessSummary> {
        self.tracker.summaries().await
    }

    pub async fn labels_in_use(&self) -> Vec<String> {
        self.tracker.labels_in_use().await
    }

    /// Serialize history, optionally only the most recent `limit` records
    pub async fn export_history(&self, limit: Option<usize>) -> String {
        self.history.read().await.serialize(limit)
    }

    /// Replace history with the records in `text`
    pub async fn import_history(&self, text: &str) -> ImportReport {
        let mut history = self.history.write().await;
        let report = history.load_and_replace(text);
        self.after_reset(&history);
        report
    }

    /// Drop every record, returning the new version
    pub async fn clear_history(&self) -> u64 {
        let mut history = self.history.write().await;
        history.clear();
        self.after_reset(&history);
        history.version()
    }

    fn after_reset(&self, history: &History) {
        self.metrics
            .set_history(history.len() as i64, history.version() as i64);
        self.logger.log_history_reset(history.version(), history.len());
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoryUtilization, ProcessIdentity};
    use crate::tracker::{LabelCriteria, ListedProcess};

    fn record(timestamp: i64) -> HistoryRecord {
        HistoryRecord {
            timestamp,
            process: ProcessIdentity::tracked(1, "app", None),
            memory: MemoryUtilization::default(),
            cpu_percent: 1.0,
            gpu_percent: 0.0,
        }
    }

    fn handle() -> ProfilerHandle {
        ProfilerHandle::new(
            Arc::new(ProcessTracker::new("app", LabelCriteria::default())),
            Arc::new(RwLock::new(History::new(100))),
            CaptureControl::new(),
        )
    }

    async fn append(handle: &ProfilerHandle, timestamps: std::ops::Range<i64>) {
        handle
            .history
            .write()
            .await
            .append_batch(timestamps.map(record));
    }

    #[tokio::test]
    async fn test_incremental_polling() {
        let handle = handle();
        append(&handle, 0..3).await;

        let first = handle.get_history(0, 0).await;
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.version, None);
        assert_eq!(first.next_offset, 3);

        append(&handle, 3..5).await;
        let second = handle.get_history(first.next_offset, 0).await;
        let timestamps: Vec<i64> = second.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_clear_invalidates_stale_consumers() {
        let handle = handle();
        append(&handle, 0..4).await;
        let before = handle.get_history(0, 0).await;

        let version = handle.clear_history().await;
        assert_eq!(version, 1);
        append(&handle, 10..12).await;

        // Old version: full set from offset 0 plus the new version
        let page = handle.get_history(before.next_offset, 0).await;
        assert_eq!(page.version, Some(1));
        let timestamps: Vec<i64> = page.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 11]);
        assert_eq!(page.next_offset, 2);
    }

    #[tokio::test]
    async fn test_export_import_cycle() {
        let handle = handle();
        append(&handle, 0..5).await;
        let text = handle.export_history(None).await;

        let other = self::handle();
        let report = other.import_history(&text).await;
        assert_eq!(report.loaded, 5);
        assert_eq!(report.skipped, 0);
        assert_eq!(other.history_stats().await.version, 1);
        assert_eq!(other.latest(10, None).await, handle.latest(10, None).await);
    }

    #[tokio::test]
    async fn test_range_and_latest_filters() {
        let handle = handle();
        append(&handle, 100..110).await;

        assert_eq!(handle.range(TimeWindow::new(105, 200), None).await.len(), 5);
        assert_eq!(
            handle
                .latest(3, Some(ProcessKind::Tracked(1)))
                .await
                .len(),
            3
        );
        assert!(handle
            .latest(3, Some(ProcessKind::WholeSystem))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_processes_and_pause() {
        let handle = handle();
        handle
            .tracker
            .reconcile(&[ListedProcess {
                pid: 9,
                name: "app".into(),
                cmdline: Some("app --main".into()),
            }])
            .await;

        let processes = handle.get_processes().await;
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 9);
        assert_eq!(handle.labels_in_use().await, vec!["main process".to_string()]);

        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
    }
}
