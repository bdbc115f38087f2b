//! Cache / eviction manager: one of four victim-selection strategies behind
//! a common trait, plus the volatile-aware memory-pressure trigger from
//! spec §4.4.
//!
//! The manager itself never holds values — it mirrors the authoritative
//! shard map (`CacheEntry` tracks bookkeeping only) and a cache miss falls
//! through to storage. This keeps `CacheManager` decoupled from the CRDT
//! value type so it can be unit-tested independent of `crdt`.

pub mod arc;
pub mod lfu;
pub mod lru;
pub mod random;

use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use hkv_common::config::EvictionPolicy;

pub use arc::ArcStrategy;
pub use lfu::LfuStrategy;
pub use lru::LruStrategy;
pub use random::RandomStrategy;

/// The bookkeeping side of spec §3's Cache Entry: `(key, value_handle,
/// created_at, last_accessed, access_count, has_ttl)`. The "value handle"
/// itself lives in the shard map; this struct only tracks accounting.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub has_ttl: bool,
    pub size: usize,
}

/// Common interface every eviction policy implements (spec §4.4).
pub trait EvictionStrategy: Send {
    fn on_access(&mut self, key: &[u8]);
    fn on_insert(&mut self, key: &[u8]);
    fn on_delete(&mut self, key: &[u8]);
    fn select_victims(&mut self, count: usize, volatile_only: bool, volatile_keys: &HashSet<Vec<u8>>) -> Vec<Vec<u8>>;
    fn clear(&mut self);
}

fn new_strategy(policy: EvictionPolicy) -> Box<dyn EvictionStrategy> {
    match policy {
        EvictionPolicy::Lru | EvictionPolicy::VolatileLru => Box::new(LruStrategy::new()),
        EvictionPolicy::Lfu | EvictionPolicy::VolatileLfu => Box::new(LfuStrategy::new()),
        EvictionPolicy::Arc => Box::new(ArcStrategy::new(1024)),
        EvictionPolicy::Random => Box::new(RandomStrategy::new()),
    }
}

fn is_volatile_only_policy(policy: EvictionPolicy) -> bool {
    matches!(policy, EvictionPolicy::VolatileLru | EvictionPolicy::VolatileLfu)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_pressure_evictions: u64,
    pub volatile_evictions: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStatsSnapshot {
    pub total_entries: usize,
    pub memory_usage: u64,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
    pub memory_pressure_evictions: u64,
    pub volatile_evictions: u64,
    pub hit_rate: f64,
}

/// Per-shard cache/eviction manager. Owns no values — just bookkeeping,
/// the policy's internal ordering structures, and the set of volatile
/// (TTL-bearing) keys a `volatile-*` policy needs.
pub struct CacheManager {
    entries: HashMap<Vec<u8>, CacheEntry>,
    volatile_keys: HashSet<Vec<u8>>,
    strategy: Box<dyn EvictionStrategy>,
    policy: EvictionPolicy,
    max_memory: u64,
    memory_threshold: f64,
    memory_usage: u64,
    stats: CacheStats,
}

impl CacheManager {
    pub fn new(policy: EvictionPolicy, max_memory: u64, memory_threshold: f64) -> Self {
        CacheManager {
            entries: HashMap::new(),
            volatile_keys: HashSet::new(),
            strategy: new_strategy(policy),
            policy,
            max_memory,
            memory_threshold,
            memory_usage: 0,
            stats: CacheStats::default(),
        }
    }

    /// `on_access`: records a hit, bumps the policy's recency/frequency
    /// bookkeeping, and updates the entry's accounting fields.
    pub fn on_access(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_accessed = Instant::now();
            entry.access_count += 1;
            self.stats.hits += 1;
            self.strategy.on_access(key);
        } else {
            self.stats.misses += 1;
        }
    }

    /// `on_insert`: registers a new (or refreshed) entry, updates memory
    /// accounting, and triggers eviction if the budget is exceeded.
    pub fn on_insert(&mut self, key: &[u8], size: usize, has_ttl: bool) {
        let now = Instant::now();
        if let Some(existing) = self.entries.get(key) {
            self.memory_usage = self.memory_usage.saturating_sub(existing.size as u64);
        }
        self.entries.insert(
            key.to_vec(),
            CacheEntry { created_at: now, last_accessed: now, access_count: 0, has_ttl, size },
        );
        if has_ttl {
            self.volatile_keys.insert(key.to_vec());
        } else {
            self.volatile_keys.remove(key);
        }
        self.memory_usage += size as u64;
        self.strategy.on_insert(key);
    }

    pub fn on_delete(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.remove(key) {
            self.memory_usage = self.memory_usage.saturating_sub(entry.size as u64);
        }
        self.volatile_keys.remove(key);
        self.strategy.on_delete(key);
    }

    pub fn set_has_ttl(&mut self, key: &[u8], has_ttl: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.has_ttl = has_ttl;
        }
        if has_ttl {
            self.volatile_keys.insert(key.to_vec());
        } else {
            self.volatile_keys.remove(key);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage
    }

    /// Eviction trigger per spec §4.4: fires once usage exceeds
    /// `max_memory * threshold`. `volatile-*` policies try volatile victims
    /// first, falling back to the full key space if none exist.
    pub fn needs_eviction(&self) -> bool {
        self.max_memory > 0
            && (self.memory_usage as f64) > (self.max_memory as f64) * self.memory_threshold
    }

    /// Selects and evicts up to `batch_size` victims if over budget. Returns
    /// the evicted keys so the caller (the owning shard) can remove them
    /// from the authoritative map and TTL index too.
    pub fn evict_if_needed(&mut self, batch_size: usize) -> Vec<Vec<u8>> {
        if !self.needs_eviction() {
            return Vec::new();
        }
        let victims = self.select_victims(batch_size);
        for key in &victims {
            self.on_delete(key);
            self.stats.evictions += 1;
            self.stats.memory_pressure_evictions += 1;
        }
        victims
    }

    /// `force_eviction(n)`: selects and deletes up to `n` victims
    /// irrespective of memory pressure.
    pub fn force_eviction(&mut self, n: usize) -> Vec<Vec<u8>> {
        let victims = self.select_victims(n);
        for key in &victims {
            self.on_delete(key);
            self.stats.evictions += 1;
        }
        victims
    }

    fn select_victims(&mut self, count: usize) -> Vec<Vec<u8>> {
        let volatile_only = is_volatile_only_policy(self.policy);
        let mut victims = self.strategy.select_victims(count, volatile_only, &self.volatile_keys);
        if victims.is_empty() && volatile_only {
            // No volatile victims: fall back to the non-volatile selection.
            victims = self.strategy.select_victims(count, false, &self.volatile_keys);
        }
        if volatile_only && !victims.is_empty() {
            self.stats.volatile_evictions += victims.len() as u64;
        }
        victims
    }

    /// `resize(new_max)`: updates the memory budget and triggers eviction
    /// if the new budget is already exceeded.
    pub fn resize(&mut self, new_max: u64) -> Vec<Vec<u8>> {
        self.max_memory = new_max;
        self.evict_if_needed(usize::MAX.min(self.entries.len().max(1)))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.volatile_keys.clear();
        self.memory_usage = 0;
        self.strategy.clear();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let total = self.stats.hits + self.stats.misses;
        let hit_rate = if total == 0 { 0.0 } else { self.stats.hits as f64 / total as f64 };
        CacheStatsSnapshot {
            total_entries: self.entries.len(),
            memory_usage: self.memory_usage,
            evictions: self.stats.evictions,
            hits: self.stats.hits,
            misses: self.stats.misses,
            memory_pressure_evictions: self.stats.memory_pressure_evictions,
            volatile_evictions: self.stats.volatile_evictions,
            hit_rate,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_triggers_over_threshold() {
        let mut mgr = CacheManager::new(EvictionPolicy::Lru, 100, 0.5);
        mgr.on_insert(b"a", 40, false);
        mgr.on_insert(b"b", 40, false);
        assert!(mgr.needs_eviction());
        let victims = mgr.evict_if_needed(10);
        assert!(!victims.is_empty());
        assert!(!mgr.needs_eviction());
    }

    #[test]
    fn volatile_policy_prefers_ttl_keys() {
        let mut mgr = CacheManager::new(EvictionPolicy::VolatileLru, 100, 0.1);
        mgr.on_insert(b"perm", 10, false);
        mgr.on_insert(b"temp", 10, true);
        let victims = mgr.evict_if_needed(1);
        assert_eq!(victims, vec![b"temp".to_vec()]);
    }

    #[test]
    fn volatile_policy_falls_back_when_no_volatile_keys() {
        let mut mgr = CacheManager::new(EvictionPolicy::VolatileLru, 100, 0.1);
        mgr.on_insert(b"perm1", 10, false);
        mgr.on_insert(b"perm2", 10, false);
        let victims = mgr.evict_if_needed(1);
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn force_eviction_ignores_memory_budget() {
        let mut mgr = CacheManager::new(EvictionPolicy::Lru, 1_000_000, 0.99);
        mgr.on_insert(b"a", 1, false);
        assert!(!mgr.needs_eviction());
        let victims = mgr.force_eviction(1);
        assert_eq!(victims, vec![b"a".to_vec()]);
    }

    #[test]
    fn resize_down_triggers_eviction() {
        let mut mgr = CacheManager::new(EvictionPolicy::Lru, 1_000, 0.9);
        mgr.on_insert(b"a", 100, false);
        mgr.on_insert(b"b", 100, false);
        assert!(!mgr.needs_eviction());
        let victims = mgr.resize(50);
        assert!(!victims.is_empty());
    }
}
