//! Published sample values shared between a sampler and the capture loop

use super::MetricKind;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// pid -> latest value cache written by one sampler and read by capture
///
/// Clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct SampleCache {
    kind: MetricKind,
    values: Arc<DashMap<u32, f64>>,
}

impl SampleCache {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            values: Arc::new(DashMap::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Publish the latest value for `pid`
    pub fn publish(&self, pid: u32, value: f64) {
        self.values.insert(pid, value);
    }

    /// Most recently published value, 0 if `pid` was never sampled
    pub fn read(&self, pid: u32) -> f64 {
        self.values.get(&pid).map(|v| *v).unwrap_or(0.0)
    }

    /// Drop published values for pids that left the tracked set
    pub fn forget(&self, pids: &[u32]) {
        for pid in pids {
            self.values.remove(pid);
        }
    }

    pub fn clear(&self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<u32, f64> {
        self.values.iter().map(|r| (*r.key(), *r.value())).collect()
    }
}

/// Rolling window of raw samples for one pid
///
/// Reports the average of the retained samples, so a CPU figure stays an
/// instantaneous percent-of-one-core.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    size: usize,
}

impl SampleWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            samples: VecDeque::with_capacity(size),
            size,
        }
    }

    /// Push a raw sample and return the smoothed value
    pub fn push(&mut self, sample: f64) -> f64 {
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}
