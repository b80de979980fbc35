//! Bounded, versioned capture history
//!
//! Records are kept in insertion (chronological) order and evicted FIFO once
//! the capacity is reached. Offsets are absolute: every record ever appended
//! since the last destructive mutation has a position, evicted ones included,
//! so an incremental consumer never re-reads or skips a record because of
//! eviction. Destructive mutations bump `version` and restart positions at 0.

pub mod codec;

use crate::models::{HistoryRecord, ProcessKind, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

/// Default number of records retained
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Outcome of replacing the history from text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Rows decoded successfully
    pub loaded: usize,
    /// Rows dropped as corrupt
    pub skipped: usize,
    /// Version after the replace
    pub version: u64,
}

/// Point-in-time statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub len: usize,
    pub capacity: usize,
    pub version: u64,
    pub next_offset: u64,
}

#[derive(Debug, Clone)]
pub struct History {
    records: VecDeque<HistoryRecord>,
    capacity: usize,
    version: u64,
    /// Absolute position of `records[0]`
    base: u64,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl History {
    /// Create an empty history holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(10_000)),
            capacity,
            version: 0,
            base: 0,
        }
    }

    /// Rebuild a history from serialized text
    ///
    /// Corrupt rows are dropped; if more rows decode than fit, the most
    /// recent `capacity` are kept.
    pub fn parse(text: &str, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        history.append_batch(codec::decode(text).records);
        history
    }

    pub fn append(&mut self, record: HistoryRecord) {
        self.records.push_back(record);
        self.evict();
    }

    /// Append a whole capture cycle in one pass
    pub fn append_batch(&mut self, records: impl IntoIterator<Item = HistoryRecord>) {
        self.records.extend(records);
        self.evict();
    }

    fn evict(&mut self) {
        while self.records.len() > self.capacity {
            self.records.pop_front();
            self.base += 1;
        }
    }

    /// The last `n` records, optionally restricted to one process
    pub fn latest(&self, n: usize, process: Option<ProcessKind>) -> Vec<HistoryRecord> {
        let mut latest: Vec<HistoryRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| process.map_or(true, |kind| r.process.kind == kind))
            .take(n)
            .cloned()
            .collect();
        latest.reverse();
        latest
    }

    /// Records whose timestamp falls inside `window`
    pub fn range(&self, window: TimeWindow, process: Option<ProcessKind>) -> Vec<HistoryRecord> {
        self.records
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .filter(|r| process.map_or(true, |kind| r.process.kind == kind))
            .cloned()
            .collect()
    }

    /// Every retained record at or after absolute position `offset`
    ///
    /// Positions already evicted resolve to the oldest retained record.
    pub fn offset_from(&self, offset: u64) -> Vec<HistoryRecord> {
        let skip = offset.saturating_sub(self.base) as usize;
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Position the next appended record will take
    pub fn next_offset(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    /// Serialize the most recent `limit` records (all when `None`)
    pub fn serialize(&self, limit: Option<usize>) -> String {
        let skip = limit.map_or(0, |limit| self.records.len().saturating_sub(limit));
        codec::encode(self.records.iter().skip(skip))
    }

    /// Drop every record, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.records.len();
        self.records.clear();
        self.base = 0;
        self.version += 1;
        info!(version = self.version, dropped, "History cleared");
        dropped
    }

    /// Replace every record with the rows decoded from `text`
    pub fn load_and_replace(&mut self, text: &str) -> ImportReport {
        let decoded = codec::decode(text);
        let loaded = decoded.records.len();

        self.records.clear();
        self.base = 0;
        self.version += 1;
        self.append_batch(decoded.records);

        info!(
            version = self.version,
            loaded,
            skipped = decoded.skipped,
            retained = self.records.len(),
            "History replaced from import"
        );

        ImportReport {
            loaded,
            skipped: decoded.skipped,
            version: self.version,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            len: self.records.len(),
            capacity: self.capacity,
            version: self.version,
            next_offset: self.next_offset(),
        }
    }
}
