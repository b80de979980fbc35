//! Append-only history log
//!
//! One file per target process name, in the same text layout as history
//! export. The file is opened in append mode for every write and never
//! rewritten, so it can be tailed while the profiler runs.

use crate::history::codec;
use crate::models::HistoryRecord;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Log file name for a target process
pub fn log_file_name(target: &str) -> String {
    format!("history-{}.csv", target)
}

#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    /// Log for `target` inside `dir`
    pub fn for_target(dir: impl AsRef<Path>, target: &str) -> Self {
        Self {
            path: dir.as_ref().join(log_file_name(target)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one capture cycle, writing the header first if the file is new
    pub fn append(&self, records: &[HistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open history log {:?}", self.path))?;

        let is_new = file
            .metadata()
            .with_context(|| format!("Failed to stat history log {:?}", self.path))?
            .len()
            == 0;

        let mut chunk = String::new();
        if is_new {
            chunk.push_str(&codec::header());
            chunk.push('\n');
        }
        for record in records {
            chunk.push_str(&codec::encode_row(record));
            chunk.push('\n');
        }

        file.write_all(chunk.as_bytes())
            .with_context(|| format!("Failed to append to history log {:?}", self.path))?;

        debug!(path = %self.path.display(), rows = records.len(), "Appended capture to history log");
        Ok(())
    }

    /// [`append`](Self::append) on the blocking pool
    pub async fn append_offloaded(&self, records: Vec<HistoryRecord>) -> Result<()> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.append(&records))
            .await
            .context("History log writer task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::models::{MemoryUtilization, ProcessIdentity};
    use tempfile::TempDir;

    fn record(timestamp: i64) -> HistoryRecord {
        HistoryRecord {
            timestamp,
            process: ProcessIdentity::tracked(7, "app", Some("worker".into())),
            memory: MemoryUtilization {
                rss_mb: 12.5,
                ..Default::default()
            },
            cpu_percent: 3.0,
            gpu_percent: 0.0,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::for_target(dir.path(), "app");

        log.append(&[record(1), record(2)]).unwrap();
        log.append(&[record(3)]).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let headers = text.lines().filter(|l| *l == codec::header()).count();
        assert_eq!(headers, 1);
        assert_eq!(text.lines().count(), 4);

        let restored = History::parse(&text, 10);
        assert_eq!(restored.len(), 3);
    }

    #[test]
    fn test_log_path_and_nested_dir() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::for_target(dir.path().join("logs"), "game");
        assert!(log.path().ends_with("logs/history-game.csv"));

        log.append(&[record(1)]).unwrap();
        assert!(log.path().exists());
    }

    #[test]
    fn test_empty_append_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::for_target(dir.path(), "app");
        log.append(&[]).unwrap();
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_offloaded_append_matches_direct_append() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::for_target(dir.path(), "app");

        log.append_offloaded(vec![record(1), record(2)]).await.unwrap();
        log.append(&[record(3)]).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.lines().next(), Some(codec::header().as_str()));
    }

    #[tokio::test]
    async fn test_offloaded_append_reports_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let log = AppendLog::for_target(&blocker, "app");
        assert!(log.append_offloaded(vec![record(1)]).await.is_err());
    }

    #[test]
    fn test_unwritable_location_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        // A regular file where the directory should be
        let log = AppendLog::for_target(&blocker, "app");
        assert!(log.append(&[record(1)]).is_err());
    }
}
