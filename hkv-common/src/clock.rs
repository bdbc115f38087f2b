//! Logical clocks: a Hybrid Logical Clock for CRDT/LWW ordering, and a
//! Vector Clock for causal comparison across nodes.
//!
//! Both are process-wide singletons per node, each guarding its state behind
//! a single `parking_lot::Mutex` — updates are O(1) and never held across an
//! await point.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 10ms-granularity physical time unit, as used for HLC physical components.
fn now_units() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (wall.as_secs_f64() * 100.0).floor() as i64
}

/// A single HLC reading: comparable, serializable, and carrying the
/// originating node so ties can be broken deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub physical: i64,
    pub logical: u64,
    pub node_id: u64,
}

impl HlcTimestamp {
    pub fn new(physical: i64, logical: u64, node_id: u64) -> Self {
        Self { physical, logical, node_id }
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.physical, self.logical, self.node_id).cmp(&(
            other.physical,
            other.logical,
            other.node_id,
        ))
    }
}

struct HlcState {
    physical: i64,
    logical: u64,
}

/// Hybrid Logical Clock. See spec §4.1: combines 10ms wall-clock granularity
/// with a logical counter so timestamps are monotonic per-node and carry
/// enough causal information to order merges across nodes.
pub struct HybridLogicalClock {
    node_id: u64,
    state: Mutex<HlcState>,
}

impl HybridLogicalClock {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            state: Mutex::new(HlcState { physical: 0, logical: 0 }),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Advance the clock for a local event and return the new timestamp.
    pub fn tick(&self) -> HlcTimestamp {
        let mut state = self.state.lock();
        let now = now_units();
        if now > state.physical {
            state.physical = now;
            state.logical = 0;
        } else {
            state.logical += 1;
        }
        HlcTimestamp::new(state.physical, state.logical, self.node_id)
    }

    /// Merge in a timestamp observed from a remote event, advancing this
    /// clock so that future local ticks causally follow it.
    pub fn update(&self, other: HlcTimestamp) -> HlcTimestamp {
        let mut state = self.state.lock();
        let now = now_units();
        let max_phys = now.max(state.physical).max(other.physical);

        if max_phys == now && now > state.physical.max(other.physical) {
            state.logical = 0;
        } else if max_phys == state.physical && state.physical > other.physical {
            state.logical += 1;
        } else if max_phys == other.physical && other.physical > state.physical {
            state.logical = other.logical + 1;
        } else {
            state.logical = state.logical.max(other.logical) + 1;
        }
        state.physical = max_phys;

        HlcTimestamp::new(state.physical, state.logical, self.node_id)
    }

    pub fn current(&self) -> HlcTimestamp {
        let state = self.state.lock();
        HlcTimestamp::new(state.physical, state.logical, self.node_id)
    }
}

/// The standard vector-clock partial order result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Less,
    Greater,
    Equal,
    Concurrent,
}

/// A mapping `node_id -> counter`. See spec §4.1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClockSnapshot(pub HashMap<u64, u64>);

pub struct VectorClock {
    node_id: u64,
    entries: Mutex<HashMap<u64, u64>>,
}

impl VectorClock {
    pub fn new(node_id: u64) -> Self {
        Self { node_id, entries: Mutex::new(HashMap::new()) }
    }

    pub fn tick(&self) -> VectorClockSnapshot {
        let mut entries = self.entries.lock();
        *entries.entry(self.node_id).or_insert(0) += 1;
        VectorClockSnapshot(entries.clone())
    }

    /// Pointwise max with `other`, then increment this node's own entry.
    pub fn update(&self, other: &VectorClockSnapshot) -> VectorClockSnapshot {
        let mut entries = self.entries.lock();
        for (&node, &count) in other.0.iter() {
            let slot = entries.entry(node).or_insert(0);
            *slot = (*slot).max(count);
        }
        *entries.entry(self.node_id).or_insert(0) += 1;
        VectorClockSnapshot(entries.clone())
    }

    pub fn snapshot(&self) -> VectorClockSnapshot {
        VectorClockSnapshot(self.entries.lock().clone())
    }

    /// Compare two snapshots using the standard vector partial order.
    pub fn compare(a: &VectorClockSnapshot, b: &VectorClockSnapshot) -> CausalOrder {
        let mut a_less = false;
        let mut b_less = false;

        let keys = a.0.keys().chain(b.0.keys());
        let mut seen = std::collections::HashSet::new();
        for k in keys {
            if !seen.insert(*k) {
                continue;
            }
            let av = a.0.get(k).copied().unwrap_or(0);
            let bv = b.0.get(k).copied().unwrap_or(0);
            match av.cmp(&bv) {
                Ordering::Less => a_less = true,
                Ordering::Greater => b_less = true,
                Ordering::Equal => {}
            }
        }

        match (a_less, b_less) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Less,
            (false, true) => CausalOrder::Greater,
            (true, true) => CausalOrder::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hlc_tick_is_monotonic() {
        let clock = HybridLogicalClock::new(1);
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev, "{:?} should be > {:?}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn hlc_update_advances_past_remote() {
        let local = HybridLogicalClock::new(1);
        let remote_ts = HlcTimestamp::new(i64::MAX / 2, 7, 2);
        let merged = local.update(remote_ts);
        assert!(merged > remote_ts);
    }

    #[test]
    fn hlc_tie_breaks_on_node_id() {
        let a = HlcTimestamp::new(100, 5, 1);
        let b = HlcTimestamp::new(100, 5, 2);
        assert!(a < b);
    }

    #[test]
    fn vector_clock_causality() {
        let vc = VectorClock::new(1);
        let t1 = vc.tick();
        let t2 = vc.tick();
        assert_eq!(VectorClock::compare(&t1, &t2), CausalOrder::Less);
    }

    #[test]
    fn vector_clock_concurrent_after_fork() {
        let a = VectorClock::new(1);
        let b = VectorClock::new(2);
        let ta = a.tick();
        let tb = b.tick();
        assert_eq!(VectorClock::compare(&ta, &tb), CausalOrder::Concurrent);
    }

    #[test]
    fn vector_clock_update_merges_and_advances() {
        let a = VectorClock::new(1);
        let b = VectorClock::new(2);
        let ta = a.tick();
        let tb = b.tick();
        let merged = a.update(&tb);
        assert_eq!(VectorClock::compare(&ta, &merged), CausalOrder::Less);
        assert_eq!(VectorClock::compare(&tb, &merged), CausalOrder::Less);
    }
}
