//! Adaptive Replacement Cache: T1/T2 resident lists, B1/B2 ghost lists, and
//! an adaptive target size `p`, per spec §4.4.

use std::collections::VecDeque;

use hashbrown::HashSet;

use super::EvictionStrategy;

fn remove_from(list: &mut VecDeque<Vec<u8>>, key: &[u8]) -> bool {
    if let Some(pos) = list.iter().position(|k| k.as_slice() == key) {
        list.remove(pos);
        true
    } else {
        false
    }
}

pub struct ArcStrategy {
    capacity: usize,
    p: usize,
    t1: VecDeque<Vec<u8>>,
    t2: VecDeque<Vec<u8>>,
    b1: VecDeque<Vec<u8>>,
    b2: VecDeque<Vec<u8>>,
}

impl ArcStrategy {
    pub fn new(capacity: usize) -> Self {
        ArcStrategy {
            capacity: capacity.max(1),
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
        }
    }

    fn trim_ghost(list: &mut VecDeque<Vec<u8>>, capacity: usize) {
        while list.len() > capacity {
            list.pop_front();
        }
    }
}

impl EvictionStrategy for ArcStrategy {
    fn on_access(&mut self, key: &[u8]) {
        if remove_from(&mut self.t1, key) {
            self.t2.push_back(key.to_vec());
        } else if remove_from(&mut self.t2, key) {
            self.t2.push_back(key.to_vec());
        }
    }

    fn on_insert(&mut self, key: &[u8]) {
        if remove_from(&mut self.b1, key) {
            let delta = (self.b2.len().max(1)) / self.b1.len().max(1);
            self.p = (self.p + delta.max(1)).min(self.capacity);
            self.t2.push_back(key.to_vec());
            return;
        }
        if remove_from(&mut self.b2, key) {
            let delta = (self.b1.len().max(1)) / self.b2.len().max(1);
            self.p = self.p.saturating_sub(delta.max(1));
            self.t2.push_back(key.to_vec());
            return;
        }
        if !self.t1.contains(key) && !self.t2.contains(key) {
            self.t1.push_back(key.to_vec());
        }
    }

    fn on_delete(&mut self, key: &[u8]) {
        remove_from(&mut self.t1, key);
        remove_from(&mut self.t2, key);
        remove_from(&mut self.b1, key);
        remove_from(&mut self.b2, key);
    }

    fn select_victims(&mut self, count: usize, volatile_only: bool, volatile_keys: &HashSet<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut victims = Vec::with_capacity(count);
        // Bounds the scan so a volatile_only pass with no eligible resident
        // key terminates instead of cycling t1/t2 forever.
        let mut remaining_candidates = self.t1.len() + self.t2.len();

        while victims.len() < count && remaining_candidates > 0 {
            let from_t1 = self.t1.len() > self.p;
            let source = if from_t1 { &mut self.t1 } else { &mut self.t2 };

            let key = match source.pop_front() {
                Some(k) => k,
                None => {
                    let other = if from_t1 { &mut self.t2 } else { &mut self.t1 };
                    match other.pop_front() {
                        Some(k) => k,
                        None => break,
                    }
                }
            };
            remaining_candidates -= 1;

            if volatile_only && !volatile_keys.contains(&key) {
                // Not eligible for eviction this pass: stays resident, requeued
                // at the tail of the list it came from so it isn't re-examined
                // before every other candidate has had a turn.
                if from_t1 {
                    self.t1.push_back(key);
                } else {
                    self.t2.push_back(key);
                }
                continue;
            }

            let ghost = if from_t1 { &mut self.b1 } else { &mut self.b2 };
            ghost.push_back(key.clone());
            Self::trim_ghost(ghost, self.capacity);
            victims.push(key);
        }
        victims
    }

    fn clear(&mut self) {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.p = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_insert_enters_t1() {
        let mut s = ArcStrategy::new(4);
        s.on_insert(b"a");
        assert!(s.t1.contains(&b"a".to_vec()));
    }

    #[test]
    fn ghost_hit_on_b1_grows_p_and_promotes_to_t2() {
        let mut s = ArcStrategy::new(4);
        s.on_insert(b"a");
        s.select_victims(1, false, &HashSet::new()); // moves a -> b1
        assert!(s.b1.contains(&b"a".to_vec()));
        s.on_insert(b"a");
        assert!(s.t2.contains(&b"a".to_vec()));
        assert!(s.p > 0);
    }

    #[test]
    fn volatile_only_skips_non_volatile_keys_without_detaching_them() {
        let mut s = ArcStrategy::new(4);
        s.on_insert(b"a");
        s.on_insert(b"b");
        let mut volatile = HashSet::new();
        volatile.insert(b"b".to_vec());

        let victims = s.select_victims(1, true, &volatile);
        assert_eq!(victims, vec![b"b".to_vec()]);
        // "a" was never evicted; it must still be resident, not parked in a
        // ghost list with no corresponding cache entry.
        assert!(s.t1.contains(&b"a".to_vec()));
        assert!(!s.b1.contains(&b"a".to_vec()));
        assert!(!s.b2.contains(&b"a".to_vec()));
    }

    #[test]
    fn volatile_only_returns_empty_when_no_volatile_keys_resident() {
        let mut s = ArcStrategy::new(4);
        s.on_insert(b"a");
        s.on_insert(b"c");
        let victims = s.select_victims(2, true, &HashSet::new());
        assert!(victims.is_empty());
        assert!(s.t1.contains(&b"a".to_vec()));
        assert!(s.t1.contains(&b"c".to_vec()));
    }
}
