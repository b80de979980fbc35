//! Per-sampler counter handle cache
//!
//! Registering a counter is expensive, polling it is cheap. The cache keeps
//! one entry per backend instance so a handle is registered once and then
//! reused every cycle until its pid leaves the tracked set or the backend is
//! reset.

use super::CounterHandle;
use std::collections::{HashMap, HashSet};

/// A live registration owned by one sampler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCacheEntry {
    /// Instance identifier the handle was registered for
    pub key: String,
    pub pid: u32,
    pub handle: CounterHandle,
    /// Sampler cycle in which the handle was registered
    pub created_at_cycle: u64,
}

/// Handle cache keyed by instance identifier
#[derive(Debug, Default)]
pub struct HandleCache {
    entries: HashMap<String, CounterCacheEntry>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CounterCacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, entry: CounterCacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Drop entries whose pid is no longer tracked, returning how many went
    pub fn retain_pids(&mut self, tracked: &HashSet<u32>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| tracked.contains(&entry.pid));
        before - self.entries.len()
    }

    /// Invalidate every entry, returning how many were dropped
    pub fn reset(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Number of registered instances for `pid`
    pub fn instances_for(&self, pid: u32) -> usize {
        self.entries.values().filter(|e| e.pid == pid).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, pid: u32, handle: u64) -> CounterCacheEntry {
        CounterCacheEntry {
            key: key.to_string(),
            pid,
            handle: CounterHandle(handle),
            created_at_cycle: 1,
        }
    }

    #[test]
    fn test_retain_pids_drops_exactly_the_stale_entries() {
        let mut cache = HandleCache::new();
        cache.insert(entry("pid_1_eng_0", 1, 10));
        cache.insert(entry("pid_1_eng_1", 1, 11));
        cache.insert(entry("pid_2_eng_0", 2, 20));

        let tracked: HashSet<u32> = [2].into_iter().collect();
        assert_eq!(cache.retain_pids(&tracked), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("pid_2_eng_0").unwrap().handle, CounterHandle(20));
    }

    #[test]
    fn test_reset_drops_everything() {
        let mut cache = HandleCache::new();
        cache.insert(entry("1", 1, 1));
        cache.insert(entry("2", 2, 2));

        assert_eq!(cache.reset(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_instances_for_counts_per_pid() {
        let mut cache = HandleCache::new();
        cache.insert(entry("pid_3_eng_0", 3, 1));
        cache.insert(entry("pid_3_eng_1", 3, 2));
        assert_eq!(cache.instances_for(3), 2);
        assert_eq!(cache.instances_for(4), 0);
    }
}
