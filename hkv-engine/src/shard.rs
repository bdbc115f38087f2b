//! A shard owns a disjoint slice of the keyspace: a `key -> CrdtValue` map,
//! its own cache manager and TTL manager, a per-shard lock, and bookkeeping
//! counters (spec §3, §4.5). All shard operations acquire the shard lock
//! before touching state; closures run under
//! [`crate::shard_manager::ShardManager::execute_on_shard`] must not reach
//! across shards (deadlock avoidance, spec §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hashbrown::HashMap;
use hkv_common::config::EvictionPolicy;
use hkv_common::{HkvError, HkvResult, HlcTimestamp};
use parking_lot::RwLock;

use crate::cache::CacheManager;
use crate::crdt::{create_crdt, CrdtKind, CrdtValue, InitialValue};
use crate::ttl::TtlManager;

#[derive(Debug, Default)]
pub struct ShardCounters {
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

struct ShardState {
    map: HashMap<Vec<u8>, CrdtValue>,
}

/// Owns one partition of the keyspace. See spec §3 "Shard State" and §4.5.
pub struct Shard {
    id: usize,
    state: RwLock<ShardState>,
    pub cache: parking_lot::Mutex<CacheManager>,
    pub ttl: TtlManager,
    counters: ShardCounters,
}

impl Shard {
    pub fn new(id: usize, eviction_policy: EvictionPolicy, max_memory: u64, memory_threshold: f64) -> Self {
        Shard {
            id,
            state: RwLock::new(ShardState { map: HashMap::new() }),
            cache: parking_lot::Mutex::new(CacheManager::new(eviction_policy, max_memory, memory_threshold)),
            ttl: TtlManager::new(),
            counters: ShardCounters::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// `get(k)`: passive TTL check happens first (spec §4.7), then a shared
    /// read of the map.
    pub fn get(&self, key: &[u8]) -> HkvResult<Option<CrdtValue>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        if self.ttl.is_expired(key) {
            self.remove_expired(key);
            return Ok(None);
        }
        let state = self.state.read();
        let value = state.map.get(key).cloned();
        drop(state);
        if value.is_some() {
            self.cache.lock().on_access(key);
        }
        Ok(value)
    }

    /// `set(k, v, ttl?, crdt_kind?)`: the generic value setter. A fresh value
    /// of `kind` seeded from `initial` is constructed and folded into any
    /// existing value of the same kind via `merge` — commutative and
    /// idempotent, so this is safe to replay from the append log or accept
    /// from a remote replica. A kind mismatch is rejected rather than
    /// silently overwritten (spec §4.2 failure mode). Dedicated mutators
    /// (`crdt_add`, `crdt_increment`, ...) mutate an existing value in
    /// place instead of merging, since accumulating operations (e.g. two
    /// increments from the same node) are not commutative with a
    /// construct-and-merge strategy.
    pub fn set(
        &self,
        key: &[u8],
        kind: CrdtKind,
        initial: Option<InitialValue>,
        node_id: u64,
        timestamp: HlcTimestamp,
        ttl: Option<Duration>,
    ) -> HkvResult<()> {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        let fresh = create_crdt(kind, initial, node_id, timestamp);
        let size = fresh.estimate_size() + key.len();

        let mut state = self.state.write();
        match state.map.get_mut(key) {
            Some(existing) if existing.kind() == kind => {
                if let Err(e) = existing.merge(&fresh) {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
            Some(existing) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(HkvError::type_mismatch(kind_name(existing.kind()), kind_name(kind)));
            }
            None => {
                state.map.insert(key.to_vec(), fresh);
            }
        }
        drop(state);

        if let Some(ttl) = ttl {
            self.ttl.set_ttl(key, ttl);
        } else {
            self.ttl.remove_ttl(key);
        }
        self.cache.lock().on_insert(key, size + 32, ttl.is_some());
        Ok(())
    }

    /// `delete(k)`: removes the value, its TTL entry, and its cache
    /// bookkeeping. Returns whether a live (non-expired) key existed.
    pub fn delete(&self, key: &[u8]) -> HkvResult<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let was_expired = self.ttl.is_expired(key);
        let mut state = self.state.write();
        let existed = state.map.remove(key).is_some();
        drop(state);
        self.ttl.remove_ttl(key);
        self.cache.lock().on_delete(key);
        Ok(existed && !was_expired)
    }

    pub fn exists(&self, key: &[u8]) -> HkvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// `crdt_add(k, item)`: mutates the existing set in place (creating a
    /// fresh `OrSet` if the key is absent) so repeated adds from the same
    /// node accumulate rather than being clobbered by merge-of-singletons.
    pub fn crdt_add(&self, key: &[u8], item: &[u8], timestamp: HlcTimestamp, node_id: u64) -> HkvResult<()> {
        let mut state = self.state.write();
        match state.map.get_mut(key) {
            Some(CrdtValue::OrSet(set)) => {
                set.add(item.to_vec());
            }
            Some(CrdtValue::LwwSet(set)) => {
                set.add(item.to_vec(), timestamp, node_id);
            }
            Some(other) => return Err(HkvError::type_mismatch("or_set or lww_set", kind_name(other.kind()))),
            None => {
                let mut set = crate::crdt::OrSet::new();
                set.add(item.to_vec());
                state.map.insert(key.to_vec(), CrdtValue::OrSet(set));
            }
        }
        drop(state);
        self.cache.lock().on_insert(key, item.len() + 64, self.ttl.has_ttl(key));
        Ok(())
    }

    pub fn crdt_remove(&self, key: &[u8], item: &[u8], timestamp: HlcTimestamp, node_id: u64) -> HkvResult<bool> {
        let mut state = self.state.write();
        match state.map.get_mut(key) {
            Some(CrdtValue::OrSet(set)) => {
                let existed = set.contains(item);
                set.remove(item);
                Ok(existed)
            }
            Some(CrdtValue::LwwSet(set)) => {
                let existed = set.contains(item);
                set.remove(item.to_vec(), timestamp, node_id);
                Ok(existed)
            }
            Some(other) => Err(HkvError::type_mismatch("or_set or lww_set", kind_name(other.kind()))),
            None => Ok(false),
        }
    }

    pub fn crdt_contains(&self, key: &[u8], item: &[u8]) -> HkvResult<bool> {
        if self.ttl.is_expired(key) {
            return Ok(false);
        }
        let state = self.state.read();
        match state.map.get(key) {
            Some(CrdtValue::OrSet(set)) => Ok(set.contains(item)),
            Some(CrdtValue::LwwSet(set)) => Ok(set.contains(item)),
            Some(other) => Err(HkvError::type_mismatch("or_set or lww_set", kind_name(other.kind()))),
            None => Ok(false),
        }
    }

    /// `crdt_increment(k, n)`: mutates the counter's per-node increment
    /// bucket in place. This is the operation spec §8 scenario 3 exercises:
    /// two increments from the same node must sum, which a
    /// construct-fresh-and-merge strategy (pointwise max) cannot express.
    pub fn crdt_increment(&self, key: &[u8], amount: u64, node_id: u64) -> HkvResult<()> {
        let mut state = self.state.write();
        match state.map.get_mut(key) {
            Some(CrdtValue::PnCounter(counter)) => {
                counter.increment(node_id, amount);
                Ok(())
            }
            Some(other) => Err(HkvError::type_mismatch("pn_counter", kind_name(other.kind()))),
            None => {
                let mut counter = crate::crdt::PnCounter::new();
                counter.increment(node_id, amount);
                state.map.insert(key.to_vec(), CrdtValue::PnCounter(counter));
                Ok(())
            }
        }
    }

    pub fn crdt_decrement(&self, key: &[u8], amount: u64, node_id: u64) -> HkvResult<()> {
        let mut state = self.state.write();
        match state.map.get_mut(key) {
            Some(CrdtValue::PnCounter(counter)) => {
                counter.decrement(node_id, amount);
                Ok(())
            }
            Some(other) => Err(HkvError::type_mismatch("pn_counter", kind_name(other.kind()))),
            None => {
                let mut counter = crate::crdt::PnCounter::new();
                counter.decrement(node_id, amount);
                state.map.insert(key.to_vec(), CrdtValue::PnCounter(counter));
                Ok(())
            }
        }
    }

    pub fn crdt_value(&self, key: &[u8]) -> HkvResult<Option<i64>> {
        if self.ttl.is_expired(key) {
            return Ok(None);
        }
        let state = self.state.read();
        match state.map.get(key) {
            Some(CrdtValue::PnCounter(counter)) => Ok(Some(counter.value())),
            Some(other) => Err(HkvError::type_mismatch("pn_counter", kind_name(other.kind()))),
            None => Ok(None),
        }
    }

    /// Captures the current raw value and TTL for `key` before a mutation,
    /// so the caller can restore it if the mutation fails to persist (spec
    /// §7: a persistence failure on a mutation rolls the in-memory change
    /// back). The shard lock is not held across the gap between this call
    /// and `restore_raw` — per spec §5, foreground operations never yield
    /// with a shard lock held, so the revert re-acquires the lock rather
    /// than holding it through the persistence I/O.
    pub fn raw_snapshot(&self, key: &[u8]) -> (Option<CrdtValue>, Option<Duration>) {
        let state = self.state.read();
        (state.map.get(key).cloned(), self.ttl.get_ttl(key))
    }

    /// Restores `key` to a value/TTL captured by `raw_snapshot`, undoing a
    /// mutation whose append-log write failed. `None` for `value` means the
    /// key did not exist before the mutation.
    pub fn restore_raw(&self, key: &[u8], value: Option<CrdtValue>, ttl: Option<Duration>) {
        let mut state = self.state.write();
        match &value {
            Some(v) => {
                state.map.insert(key.to_vec(), v.clone());
            }
            None => {
                state.map.remove(key);
            }
        }
        drop(state);
        match ttl {
            Some(d) => {
                self.ttl.set_ttl(key, d);
            }
            None => {
                self.ttl.remove_ttl(key);
            }
        }
        match value {
            Some(v) => {
                let size = v.estimate_size() + key.len() + 32;
                self.cache.lock().on_insert(key, size, ttl.is_some());
            }
            None => {
                self.cache.lock().on_delete(key);
            }
        }
    }

    /// Merges a remote CRDT value into this shard's copy, or adopts it
    /// fresh if the key is absent. Used for cross-replica convergence and
    /// for snapshot/append-log replay during recovery. Also feeds the cache
    /// manager's bookkeeping, the way `set` does, so memory accounting
    /// reflects the restored keyspace immediately after recovery rather
    /// than only as keys are re-accessed.
    pub fn merge_remote(&self, key: &[u8], remote: CrdtValue) -> HkvResult<()> {
        let mut state = self.state.write();
        let result = match state.map.get_mut(key) {
            Some(existing) => existing.merge(&remote),
            None => {
                state.map.insert(key.to_vec(), remote);
                Ok(())
            }
        };
        let size = state.map.get(key).map(|v| v.estimate_size() + key.len() + 32);
        drop(state);
        if result.is_ok() {
            if let Some(size) = size {
                self.cache.lock().on_insert(key, size, self.ttl.has_ttl(key));
            }
        }
        result
    }

    /// Used by the TTL sweep's `on_expire` callback and by passive
    /// expiration: removes the map entry and cache bookkeeping for a key
    /// the TTL manager has already judged expired.
    pub fn remove_expired(&self, key: &[u8]) {
        let mut state = self.state.write();
        state.map.remove(key);
        drop(state);
        self.cache.lock().on_delete(key);
    }

    /// Every live key currently resident, for `scan`. Pattern matching and
    /// cursoring are the shard manager's responsibility. Consults the TTL
    /// manager the same way `get` does, so a key that expired since the last
    /// active sweep tick is never surfaced (spec §8: "the key is absent from
    /// subsequent scan"), and drops it from the map on the way out rather
    /// than leaving it for the sweep to find later.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let state = self.state.read();
        let keys: Vec<Vec<u8>> = state.map.keys().cloned().collect();
        drop(state);
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            if self.ttl.is_expired(&key) {
                self.remove_expired(&key);
            } else {
                live.push(key);
            }
        }
        live
    }

    pub fn len(&self) -> usize {
        self.state.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &ShardCounters {
        &self.counters
    }

    /// Runs the cache's memory-pressure eviction and removes any victims
    /// from the authoritative map and TTL index too.
    pub fn evict_if_needed(&self, batch_size: usize) -> Vec<Vec<u8>> {
        let victims = self.cache.lock().evict_if_needed(batch_size);
        if !victims.is_empty() {
            let mut state = self.state.write();
            for key in &victims {
                state.map.remove(key);
            }
            drop(state);
            for key in &victims {
                self.ttl.remove_ttl(key);
            }
        }
        victims
    }

    /// A consistent point-in-time snapshot of every live entry, for the
    /// persistence layer. Holds the read lock only long enough to clone
    /// the (small) CRDT values — they are immutable after merge completes,
    /// so a clone is as good as a reference for snapshot purposes (spec
    /// §4.6(b)).
    pub fn snapshot_entries(&self) -> Vec<(Vec<u8>, CrdtValue, Option<Duration>)> {
        let state = self.state.read();
        state
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone(), self.ttl.get_ttl(k)))
            .collect()
    }

    /// Wipes all shard state. Used when loading a snapshot before replay.
    pub fn clear(&self) {
        self.state.write().map.clear();
        self.ttl.clear();
        self.cache.lock().clear();
    }
}

fn kind_name(kind: CrdtKind) -> &'static str {
    match kind {
        CrdtKind::Lww => "lww_register",
        CrdtKind::LwwSet => "lww_set",
        CrdtKind::OrSet => "or_set",
        CrdtKind::Counter => "pn_counter",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> HlcTimestamp {
        HlcTimestamp::new(1, 0, 1)
    }

    fn shard() -> Shard {
        Shard::new(0, EvictionPolicy::Lru, 1024 * 1024, 0.9)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let s = shard();
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v".to_vec())), 1, ts(), None).unwrap();
        let value = s.get(b"k").unwrap().unwrap();
        match value {
            CrdtValue::LwwRegister(r) => assert_eq!(r.get(), Some(&b"v"[..])),
            _ => panic!("expected lww"),
        }
    }

    #[test]
    fn delete_removes_key() {
        let s = shard();
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v".to_vec())), 1, ts(), None).unwrap();
        assert!(s.delete(b"k").unwrap());
        assert!(s.get(b"k").unwrap().is_none());
        assert!(!s.delete(b"k").unwrap());
    }

    #[test]
    fn type_mismatch_on_second_set_is_rejected() {
        let s = shard();
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v".to_vec())), 1, ts(), None).unwrap();
        let err = s.set(b"k", CrdtKind::Counter, Some(InitialValue::Amount(1)), 1, ts(), None).unwrap_err();
        assert_eq!(err.kind(), hkv_common::ErrorKind::TypeMismatch);
    }

    #[test]
    fn ttl_expiry_hides_key() {
        let s = shard();
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v".to_vec())), 1, ts(), Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.get(b"k").unwrap().is_none());
    }

    #[test]
    fn repeated_increments_from_same_node_accumulate() {
        let s = shard();
        s.crdt_increment(b"c", 5, 1).unwrap();
        s.crdt_increment(b"c", 3, 1).unwrap();
        assert_eq!(s.crdt_value(b"c").unwrap(), Some(8));
    }

    #[test]
    fn increment_then_decrement_from_different_nodes() {
        let s = shard();
        s.crdt_increment(b"c", 5, 1).unwrap();
        s.crdt_increment(b"c", 3, 1).unwrap();
        s.crdt_decrement(b"c", 2, 2).unwrap();
        assert_eq!(s.crdt_value(b"c").unwrap(), Some(6));
    }

    #[test]
    fn crdt_add_and_contains() {
        let s = shard();
        s.crdt_add(b"s", b"x", ts(), 1).unwrap();
        assert!(s.crdt_contains(b"s", b"x").unwrap());
        assert!(!s.crdt_contains(b"s", b"y").unwrap());
    }

    #[test]
    fn raw_snapshot_restore_undoes_a_set_on_new_key() {
        let s = shard();
        let (prior_value, prior_ttl) = s.raw_snapshot(b"k");
        assert!(prior_value.is_none());
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v".to_vec())), 1, ts(), None).unwrap();
        assert!(s.get(b"k").unwrap().is_some());

        s.restore_raw(b"k", prior_value, prior_ttl);
        assert!(s.get(b"k").unwrap().is_none());
    }

    #[test]
    fn raw_snapshot_restore_undoes_an_overwrite() {
        let s = shard();
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v1".to_vec())), 1, ts(), None).unwrap();
        let (prior_value, prior_ttl) = s.raw_snapshot(b"k");

        let later = HlcTimestamp::new(2, 0, 1);
        s.set(b"k", CrdtKind::Lww, Some(InitialValue::Bytes(b"v2".to_vec())), 1, later, None).unwrap();
        assert_eq!(
            s.get(b"k").unwrap().unwrap(),
            CrdtValue::LwwRegister(crate::crdt::LwwRegister::new(b"v2".to_vec(), later, 1))
        );

        s.restore_raw(b"k", prior_value, prior_ttl);
        match s.get(b"k").unwrap().unwrap() {
            CrdtValue::LwwRegister(r) => assert_eq!(r.get(), Some(&b"v1"[..])),
            _ => panic!("expected lww"),
        }
    }
}
