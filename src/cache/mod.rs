//! L0 action cache.
//!
//! Maps screen fingerprints to an action that previously worked on a similar screen,
//! so a recurring screen can be handled without consulting the model. Entries are
//! bounded by a reuse budget and dropped as soon as a replay fails to verify.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actions::Action;
use crate::capture::Fingerprint;

pub const DEFAULT_HASH_THRESHOLD: u32 = 5;
pub const DEFAULT_MAX_REUSE: u32 = 3;
pub const DEFAULT_CAPACITY: usize = 256;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum Hamming distance for a lookup to match.
    pub hash_threshold: u32,
    /// Replays allowed before an entry is retired.
    pub max_reuse: u32,
    /// Oldest entries are evicted beyond this size.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_threshold: DEFAULT_HASH_THRESHOLD,
            max_reuse: DEFAULT_MAX_REUSE,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_hash_threshold(mut self, threshold: u32) -> Self {
        self.hash_threshold = threshold;
        self
    }

    pub fn with_max_reuse(mut self, max_reuse: u32) -> Self {
        self.max_reuse = max_reuse;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// A cached decision for one screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub action: Action,
    pub reuse_count: u32,
    pub max_reuse: u32,
    /// Fingerprint observed after the action first succeeded.
    pub expected_post: Option<Fingerprint>,
    #[serde(skip)]
    seq: u64,
}

impl CacheEntry {
    pub fn is_exhausted(&self) -> bool {
        self.reuse_count >= self.max_reuse
    }
}

/// Lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
pub struct ActionCache {
    entries: Vec<CacheEntry>,
    hash_threshold: u32,
    max_reuse: u32,
    capacity: usize,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

impl ActionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Vec::new(),
            hash_threshold: config.hash_threshold,
            max_reuse: config.max_reuse,
            capacity: config.capacity.max(1),
            next_seq: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Closest usable entry within the threshold. Ties go to the most recent entry.
    pub fn lookup(&mut self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        let found = self
            .entries
            .iter()
            .filter(|e| !e.is_exhausted())
            .map(|e| (e.fingerprint.distance(fingerprint), e))
            .filter(|(distance, _)| *distance <= self.hash_threshold)
            .min_by(|(da, a), (db, b)| da.cmp(db).then(b.seq.cmp(&a.seq)))
            .map(|(_, e)| e.clone());

        match found {
            Some(entry) => {
                self.hits += 1;
                debug!(
                    "L0 hit {} -> {} ({}/{})",
                    fingerprint, entry.fingerprint, entry.reuse_count, entry.max_reuse
                );
                Some(entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store an action that verified successfully. Terminal actions are never cached.
    ///
    /// Recording an existing fingerprint replaces that entry.
    pub fn record(
        &mut self,
        fingerprint: Fingerprint,
        action: Action,
        expected_post: Option<Fingerprint>,
    ) -> bool {
        if action.is_terminal() || self.max_reuse == 0 {
            return false;
        }
        self.entries.retain(|e| e.fingerprint != fingerprint);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.seq)
                .map(|(i, _)| i);
            match oldest {
                Some(index) => {
                    self.entries.remove(index);
                }
                None => break,
            }
        }
        self.entries.push(CacheEntry {
            fingerprint,
            action,
            reuse_count: 0,
            max_reuse: self.max_reuse,
            expected_post,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    /// Count one replay of the entry keyed by `fingerprint`.
    ///
    /// Returns the new reuse count; the entry is dropped once its budget is spent.
    pub fn mark_used(&mut self, fingerprint: Fingerprint) -> Option<u32> {
        let index = self.entries.iter().position(|e| e.fingerprint == fingerprint)?;
        let entry = &mut self.entries[index];
        entry.reuse_count += 1;
        let count = entry.reuse_count;
        if entry.is_exhausted() {
            debug!("L0 entry {} exhausted after {} replays", fingerprint, count);
            self.entries.remove(index);
        }
        Some(count)
    }

    pub fn invalidate(&mut self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        let index = self.entries.iter().position(|e| e.fingerprint == fingerprint)?;
        debug!("L0 entry {} invalidated", fingerprint);
        Some(self.entries.remove(index))
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.fingerprint == fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Point;

    fn click(x: i32) -> Action {
        Action::Click {
            point: Point::new(x, 0),
        }
    }

    fn cache() -> ActionCache {
        ActionCache::new(&CacheConfig::default())
    }

    #[test]
    fn test_miss_then_hit_within_threshold() {
        let mut cache = cache();
        assert!(cache.lookup(Fingerprint(0)).is_none());
        cache.record(Fingerprint(0), click(1), None);
        // 5 bits differ: still within the default threshold
        let hit = cache.lookup(Fingerprint(0b11111)).unwrap();
        assert_eq!(hit.action, click(1));
        assert!(cache.lookup(Fingerprint(0b111111)).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 2
            }
        );
    }

    #[test]
    fn test_closest_entry_wins_then_newest() {
        let mut cache = cache();
        cache.record(Fingerprint(0b1), click(1), None);
        cache.record(Fingerprint(0b11), click(2), None);
        assert_eq!(cache.lookup(Fingerprint(0b1)).unwrap().action, click(1));

        // equidistant: 0b100 and 0b010 are both 1 bit away from 0
        let mut cache = self::cache();
        cache.record(Fingerprint(0b100), click(1), None);
        cache.record(Fingerprint(0b010), click(2), None);
        assert_eq!(cache.lookup(Fingerprint(0)).unwrap().action, click(2));
    }

    #[test]
    fn test_reuse_budget_retires_entry() {
        let mut cache = ActionCache::new(&CacheConfig::default().with_max_reuse(2));
        cache.record(Fingerprint(7), click(1), None);
        assert_eq!(cache.mark_used(Fingerprint(7)), Some(1));
        assert!(cache.lookup(Fingerprint(7)).is_some());
        assert_eq!(cache.mark_used(Fingerprint(7)), Some(2));
        assert!(cache.lookup(Fingerprint(7)).is_none());
        assert!(cache.get(Fingerprint(7)).is_none());
        assert_eq!(cache.mark_used(Fingerprint(7)), None);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let mut cache = cache();
        cache.record(Fingerprint(9), click(1), Some(Fingerprint(10)));
        let removed = cache.invalidate(Fingerprint(9)).unwrap();
        assert_eq!(removed.expected_post, Some(Fingerprint(10)));
        assert!(cache.is_empty());
        assert!(cache.invalidate(Fingerprint(9)).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ActionCache::new(&CacheConfig::default().with_capacity(2));
        cache.record(Fingerprint(u64::MAX), click(1), None);
        cache.record(Fingerprint(0), click(2), None);
        cache.record(Fingerprint(0xffff_0000), click(3), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(Fingerprint(u64::MAX)).is_none());
    }

    #[test]
    fn test_record_replaces_same_fingerprint_and_skips_terminal() {
        let mut cache = cache();
        cache.record(Fingerprint(1), click(1), None);
        cache.mark_used(Fingerprint(1));
        cache.record(Fingerprint(1), click(2), None);
        let entry = cache.get(Fingerprint(1)).unwrap();
        assert_eq!(entry.action, click(2));
        assert_eq!(entry.reuse_count, 0);

        assert!(!cache.record(Fingerprint(2), Action::Finished { message: None }, None));
        assert_eq!(cache.len(), 1);
    }
}
