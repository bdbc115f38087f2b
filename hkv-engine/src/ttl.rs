//! TTL (time-to-live) management with active heap-driven sweep and passive
//! on-access expiration. Grounded in the original `TTLManager`: a key's
//! authoritative expiry lives in `entries`; the heap may carry stale
//! records and is cheap to skip over (spec §4.3, §9 design notes).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

/// Rebuild the heap once its size exceeds this multiple of the live entry
/// count (spec §9: "add a background heap-rebuild step when |heap| > 2·|entries|").
const HEAP_REBUILD_RATIO: usize = 2;

/// TTL state for a key: missing, present with no expiry, or present with
/// remaining time. Distinguishing `NoExpiry` from `ExpiresIn(Duration::ZERO)`
/// is what lets `ttl(k)` (spec §6: "optional seconds") tell a persistent key
/// apart from one with under a second left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

#[derive(Debug, Clone, Copy)]
struct TtlEntry {
    expires_at: Instant,
    created_at: Instant,
}

#[derive(Debug, Default)]
pub struct TtlStats {
    pub total_keys_with_ttl: AtomicU64,
    pub expired_keys: AtomicU64,
    pub active_expirations: AtomicU64,
    pub passive_expirations: AtomicU64,
    pub cleanup_cycles: AtomicU64,
}

/// A point-in-time copy of [`TtlStats`] plus derived fields, matching
/// `TTLManager.get_stats()` from the original implementation.
#[derive(Debug, Clone, Copy)]
pub struct TtlStatsSnapshot {
    pub total_keys_with_ttl: u64,
    pub expired_keys: u64,
    pub active_expirations: u64,
    pub passive_expirations: u64,
    pub cleanup_cycles: u64,
    pub current_keys_with_ttl: usize,
    pub heap_size: usize,
}

struct Inner {
    entries: HashMap<Vec<u8>, TtlEntry>,
    heap: BinaryHeap<Reverse<(Instant, Vec<u8>)>>,
}

/// Per-shard TTL index. One instance lives inside each [`crate::shard::Shard`].
pub struct TtlManager {
    inner: Mutex<Inner>,
    stats: TtlStats,
}

impl TtlManager {
    pub fn new() -> Self {
        TtlManager {
            inner: Mutex::new(Inner { entries: HashMap::new(), heap: BinaryHeap::new() }),
            stats: TtlStats::default(),
        }
    }

    /// `set_ttl`: rejects non-positive durations. Replaces any existing
    /// entry and pushes a fresh heap record.
    pub fn set_ttl(&self, key: &[u8], ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut inner = self.inner.lock();
        let had_previous = inner.entries.remove(key).is_some();
        inner.entries.insert(key.to_vec(), TtlEntry { expires_at, created_at: now });
        inner.heap.push(Reverse((expires_at, key.to_vec())));
        if !had_previous {
            self.stats.total_keys_with_ttl.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// `get_ttl`: returns remaining time, actively expiring (and returning
    /// `None`) if the entry is already past its deadline.
    pub fn get_ttl(&self, key: &[u8]) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = *inner.entries.get(key)?;
        if entry.expires_at <= now {
            inner.entries.remove(key);
            drop(inner);
            self.record_expiry(false);
            return None;
        }
        Some(entry.expires_at - now)
    }

    /// `remove_ttl`: drops the authoritative entry; the heap record is left
    /// for lazy cleanup.
    pub fn remove_ttl(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            self.stats.total_keys_with_ttl.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// `is_expired`: true iff a TTL is set and has elapsed, actively
    /// expiring the entry as a side effect.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at <= now => {
                inner.entries.remove(key);
                drop(inner);
                self.record_expiry(false);
                true
            }
            _ => false,
        }
    }

    pub fn has_ttl(&self, key: &[u8]) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// `get_expired_keys`: pops expired heap tops, skipping stale records
    /// whose `expires_at` no longer matches the authoritative entry.
    pub fn get_expired_keys(&self, max_keys: Option<usize>) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let limit = max_keys.unwrap_or(usize::MAX);
        let mut expired = Vec::new();
        let mut inner = self.inner.lock();

        while expired.len() < limit {
            let top = match inner.heap.peek() {
                Some(Reverse((expires_at, _))) if *expires_at <= now => inner.heap.pop(),
                _ => break,
            };
            let Reverse((expires_at, key)) = match top {
                Some(t) => t,
                None => break,
            };
            if let Some(entry) = inner.entries.get(&key) {
                if entry.expires_at == expires_at {
                    inner.entries.remove(&key);
                    expired.push(key);
                }
            }
        }
        expired
    }

    /// Removes stale heap records whose key no longer matches the
    /// authoritative entry, bounding heap growth.
    pub fn compact_heap_if_needed(&self) {
        let mut inner = self.inner.lock();
        if inner.heap.len() <= inner.entries.len() * HEAP_REBUILD_RATIO {
            return;
        }
        let live: BinaryHeap<Reverse<(Instant, Vec<u8>)>> = inner
            .heap
            .drain()
            .filter(|Reverse((expires_at, key))| {
                inner.entries.get(key).map(|e| e.expires_at == *expires_at).unwrap_or(false)
            })
            .collect();
        inner.heap = live;
    }

    /// Active-expiration entry point for the background sweep: pulls up to
    /// `max_per_check` expired keys, records them as actively expired, and
    /// invokes `on_expire` for each outside the lock.
    pub fn sweep(&self, max_per_check: usize, mut on_expire: impl FnMut(&[u8])) -> usize {
        let expired = self.get_expired_keys(Some(max_per_check));
        for _ in &expired {
            self.record_expiry(true);
        }
        self.compact_heap_if_needed();
        self.stats.cleanup_cycles.fetch_add(1, Ordering::Relaxed);
        for key in &expired {
            on_expire(key);
        }
        expired.len()
    }

    fn record_expiry(&self, active: bool) {
        self.stats.total_keys_with_ttl.fetch_sub(1, Ordering::Relaxed);
        self.stats.expired_keys.fetch_add(1, Ordering::Relaxed);
        if active {
            self.stats.active_expirations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.passive_expirations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> TtlStatsSnapshot {
        let inner = self.inner.lock();
        TtlStatsSnapshot {
            total_keys_with_ttl: self.stats.total_keys_with_ttl.load(Ordering::Relaxed),
            expired_keys: self.stats.expired_keys.load(Ordering::Relaxed),
            active_expirations: self.stats.active_expirations.load(Ordering::Relaxed),
            passive_expirations: self.stats.passive_expirations.load(Ordering::Relaxed),
            cleanup_cycles: self.stats.cleanup_cycles.load(Ordering::Relaxed),
            current_keys_with_ttl: inner.entries.len(),
            heap_size: inner.heap.len(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.heap.clear();
        self.stats.total_keys_with_ttl.store(0, Ordering::Relaxed);
    }
}

impl Default for TtlManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn set_and_get_ttl_reports_remaining_time() {
        let mgr = TtlManager::new();
        mgr.set_ttl(b"k", Duration::from_secs(60));
        let remaining = mgr.get_ttl(b"k").unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mgr = TtlManager::new();
        assert!(!mgr.set_ttl(b"k", Duration::ZERO));
        assert!(mgr.get_ttl(b"k").is_none());
    }

    #[test]
    fn expired_key_is_passively_removed() {
        let mgr = TtlManager::new();
        mgr.set_ttl(b"k", Duration::from_millis(1));
        sleep(Duration::from_millis(5));
        assert!(mgr.get_ttl(b"k").is_none());
        let stats = mgr.stats();
        assert_eq!(stats.passive_expirations, 1);
    }

    #[test]
    fn remove_ttl_leaves_stale_heap_entry() {
        let mgr = TtlManager::new();
        mgr.set_ttl(b"k", Duration::from_secs(60));
        assert!(mgr.remove_ttl(b"k"));
        assert_eq!(mgr.stats().heap_size, 1);
        assert_eq!(mgr.stats().current_keys_with_ttl, 0);
    }

    #[test]
    fn sweep_picks_up_expired_keys() {
        let mgr = TtlManager::new();
        mgr.set_ttl(b"a", Duration::from_millis(1));
        mgr.set_ttl(b"b", Duration::from_secs(60));
        sleep(Duration::from_millis(5));

        let mut expired = Vec::new();
        let count = mgr.sweep(10, |k| expired.push(k.to_vec()));
        assert_eq!(count, 1);
        assert_eq!(expired, vec![b"a".to_vec()]);
        assert_eq!(mgr.stats().active_expirations, 1);
    }

    #[test]
    fn compact_heap_drops_stale_records() {
        let mgr = TtlManager::new();
        for _ in 0..3 {
            mgr.set_ttl(b"k", Duration::from_secs(60));
        }
        mgr.compact_heap_if_needed();
        assert_eq!(mgr.stats().heap_size, 1);
    }
}
