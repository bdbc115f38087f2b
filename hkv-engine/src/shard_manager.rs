//! Routes keys to their owning shard by a stable 64-bit hash and executes
//! closures against it (spec §4.5). Placement strategy is carried as opaque
//! metadata for an external worker-assignment collaborator; the core never
//! acts on it.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use hkv_common::config::{EvictionPolicy, PlacementStrategy};

use crate::shard::Shard;

pub struct ShardManager {
    shards: Vec<Shard>,
    placement_strategy: PlacementStrategy,
}

impl ShardManager {
    pub fn new(
        num_shards: u32,
        eviction_policy: EvictionPolicy,
        max_memory: u64,
        memory_threshold: f64,
        placement_strategy: PlacementStrategy,
    ) -> Self {
        let num_shards = num_shards.max(1) as usize;
        let per_shard_memory = max_memory / num_shards as u64;
        let shards = (0..num_shards)
            .map(|id| Shard::new(id, eviction_policy, per_shard_memory, memory_threshold))
            .collect();
        ShardManager { shards, placement_strategy }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn placement_strategy(&self) -> PlacementStrategy {
        self.placement_strategy
    }

    /// Stable 64-bit non-cryptographic hash of key bytes, modulo shard count
    /// (spec §4.5). `DefaultHasher::new()` starts from fixed (not
    /// per-process-random) keys, so the mapping is stable across process
    /// restarts — required for recovery to route replayed records to the
    /// same shard they were written from.
    pub fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    pub fn shard(&self, id: usize) -> &Shard {
        &self.shards[id]
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// `execute_on_shard(key, closure)`: routes to the owning shard and runs
    /// `f` against it. Callers must not reach into another shard from
    /// within `f` (spec §5 deadlock avoidance: no cross-shard lock is ever
    /// acquired while holding a shard lock).
    pub fn execute_on_shard<T>(&self, key: &[u8], f: impl FnOnce(&Shard) -> T) -> T {
        f(self.shard_for(key))
    }

    pub fn total_keys(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// `scan(cursor, glob, count)`: walks shards in order starting at
    /// `cursor`'s shard index, matching each live key against `pattern`
    /// (a simple glob: `*` matches any run of bytes, `?` matches one byte,
    /// anything else is literal). The cursor packs both the shard index
    /// (high 32 bits) and an offset into that shard's key list (low 32
    /// bits), so hitting `count` partway through a shard resumes inside
    /// that same shard on the next call rather than skipping its
    /// remaining keys. The cursor is opaque beyond that — spec §9 leaves
    /// total ordering across calls unspecified.
    pub fn scan(&self, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<Vec<u8>>) {
        let mut results = Vec::with_capacity(count);
        let num_shards = self.shards.len().max(1);
        let start_shard = ((cursor >> 32) as usize) % num_shards;
        let start_offset = (cursor & 0xFFFF_FFFF) as usize;

        for offset in 0..self.shards.len() {
            let idx = (start_shard + offset) % self.shards.len();
            let keys = self.shards[idx].keys();
            let skip = if offset == 0 { start_offset } else { 0 };
            for pos in skip..keys.len() {
                let key = &keys[pos];
                if glob_match(pattern, key) {
                    results.push(key.clone());
                    if results.len() >= count {
                        let next_pos = pos + 1;
                        let next_cursor = if next_pos < keys.len() {
                            pack_cursor(idx, next_pos)
                        } else if offset + 1 < self.shards.len() {
                            pack_cursor((idx + 1) % self.shards.len(), 0)
                        } else {
                            0
                        };
                        return (next_cursor, results);
                    }
                }
            }
        }
        (0, results)
    }

    /// Runs cache-pressure eviction across every shard. Called by the
    /// server's memory-monitor background task.
    pub fn evict_if_needed(&self, batch_size: usize) -> usize {
        self.shards.iter().map(|s| s.evict_if_needed(batch_size).len()).sum()
    }
}

/// Packs a shard index and an intra-shard key offset into one opaque cursor.
fn pack_cursor(shard_idx: usize, key_offset: usize) -> u64 {
    ((shard_idx as u64) << 32) | (key_offset as u64 & 0xFFFF_FFFF)
}

/// Minimal glob matcher: `*` matches any byte run, `?` matches exactly one
/// byte, all other bytes match literally. Sufficient for the key patterns
/// `scan` is expected to take (spec §8 scenario 6 uses a trailing `*`).
fn glob_match(pattern: &str, key: &[u8]) -> bool {
    glob_match_bytes(pattern.as_bytes(), key)
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            glob_match_bytes(&pattern[1..], text)
                || (!text.is_empty() && glob_match_bytes(pattern, &text[1..]))
        }
        Some(b'?') => !text.is_empty() && glob_match_bytes(&pattern[1..], &text[1..]),
        Some(&c) => !text.is_empty() && text[0] == c && glob_match_bytes(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_common::HlcTimestamp;

    fn manager(n: u32) -> ShardManager {
        ShardManager::new(n, EvictionPolicy::Lru, 1024 * 1024, 0.9, PlacementStrategy::NumaAware)
    }

    #[test]
    fn same_key_always_routes_to_same_shard() {
        let m = manager(8);
        let a = m.shard_index(b"hello");
        let b = m.shard_index(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_keys_can_land_on_different_shards() {
        let m = manager(8);
        let indices: std::collections::HashSet<usize> =
            (0..64).map(|i| m.shard_index(format!("key-{i}").as_bytes())).collect();
        assert!(indices.len() > 1, "expected keys to spread across shards");
    }

    #[test]
    fn scan_matches_glob_pattern() {
        let m = manager(4);
        let ts = HlcTimestamp::new(1, 0, 1);
        for key in ["scan1", "scan2", "other"] {
            m.execute_on_shard(key.as_bytes(), |shard| {
                shard
                    .set(
                        key.as_bytes(),
                        crate::crdt::CrdtKind::Lww,
                        Some(crate::crdt::InitialValue::Bytes(b"v".to_vec())),
                        1,
                        ts,
                        None,
                    )
                    .unwrap();
            });
        }

        let (_, found) = m.scan(0, "scan*", 10);
        let found: std::collections::HashSet<Vec<u8>> = found.into_iter().collect();
        assert!(found.contains(&b"scan1".to_vec()));
        assert!(found.contains(&b"scan2".to_vec()));
        assert!(!found.contains(&b"other".to_vec()));
    }

    #[test]
    fn glob_star_matches_empty_suffix() {
        assert!(glob_match("scan*", b"scan"));
        assert!(glob_match("scan*", b"scan123"));
        assert!(!glob_match("scan*", b"other"));
    }

    #[test]
    fn scan_resumes_inside_a_shard_instead_of_skipping_keys() {
        let m = manager(1);
        let ts = HlcTimestamp::new(1, 0, 1);
        let total = 25;
        for i in 0..total {
            let key = format!("k{i}");
            m.execute_on_shard(key.as_bytes(), |shard| {
                shard
                    .set(
                        key.as_bytes(),
                        crate::crdt::CrdtKind::Lww,
                        Some(crate::crdt::InitialValue::Bytes(b"v".to_vec())),
                        1,
                        ts,
                        None,
                    )
                    .unwrap();
            });
        }

        let mut seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, found) = m.scan(cursor, "*", 4);
            seen.extend(found);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        assert_eq!(seen.len(), total);
    }
}
