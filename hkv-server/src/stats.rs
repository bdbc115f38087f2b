//! Aggregate stats and info surfaces (spec.md §6 `get_stats`/`get_info`,
//! SPEC_FULL.md §2.1/§2.2), folded from every shard's TTL and cache
//! snapshots plus server-level counters.

use hkv_engine::cache::CacheStatsSnapshot;
use hkv_engine::ttl::TtlStatsSnapshot;

#[derive(Debug, Clone, Copy, Default)]
pub struct TtlStatsTotal {
    pub total_keys_with_ttl: u64,
    pub expired_keys: u64,
    pub active_expirations: u64,
    pub passive_expirations: u64,
    pub cleanup_cycles: u64,
    pub current_keys_with_ttl: usize,
    pub heap_size: usize,
}

impl TtlStatsTotal {
    fn add(&mut self, s: TtlStatsSnapshot) {
        self.total_keys_with_ttl += s.total_keys_with_ttl;
        self.expired_keys += s.expired_keys;
        self.active_expirations += s.active_expirations;
        self.passive_expirations += s.passive_expirations;
        self.cleanup_cycles += s.cleanup_cycles;
        self.current_keys_with_ttl += s.current_keys_with_ttl;
        self.heap_size += s.heap_size;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatsTotal {
    pub total_entries: usize,
    pub memory_usage: u64,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
    pub memory_pressure_evictions: u64,
    pub volatile_evictions: u64,
    pub hit_rate: f64,
}

impl CacheStatsTotal {
    fn add(&mut self, s: CacheStatsSnapshot) {
        self.total_entries += s.total_entries;
        self.memory_usage += s.memory_usage;
        self.evictions += s.evictions;
        self.hits += s.hits;
        self.misses += s.misses;
        self.memory_pressure_evictions += s.memory_pressure_evictions;
        self.volatile_evictions += s.volatile_evictions;
    }

    fn finalize(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 { 0.0 } else { self.hits as f64 / total as f64 };
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShardCounterTotal {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

/// `get_stats()`'s full payload: per-component totals across every shard
/// plus server-level request counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub ttl: TtlStatsTotal,
    pub cache: CacheStatsTotal,
    pub ops: ShardCounterTotal,
    pub uptime_secs: u64,
    pub total_keys: usize,
}

impl ServerStats {
    pub fn collect(
        shards: &hkv_engine::ShardManager,
        uptime_secs: u64,
    ) -> Self {
        let mut ttl = TtlStatsTotal::default();
        let mut cache = CacheStatsTotal::default();
        let mut ops = ShardCounterTotal::default();

        for shard in shards.shards() {
            ttl.add(shard.ttl.stats());
            cache.add(shard.cache.lock().stats());
            let counters = shard.counters();
            ops.gets += counters.gets.load(std::sync::atomic::Ordering::Relaxed);
            ops.sets += counters.sets.load(std::sync::atomic::Ordering::Relaxed);
            ops.deletes += counters.deletes.load(std::sync::atomic::Ordering::Relaxed);
            ops.errors += counters.errors.load(std::sync::atomic::Ordering::Relaxed);
        }
        cache.finalize();

        ServerStats { ttl, cache, ops, uptime_secs, total_keys: shards.total_keys() }
    }
}

/// `get_info()`'s payload: identity, uptime, and the degraded-state flag
/// (SPEC_FULL.md §2.2).
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub node_id: String,
    pub version: &'static str,
    pub role: &'static str,
    pub uptime_secs: u64,
    pub degraded: bool,
    pub num_shards: usize,
}
