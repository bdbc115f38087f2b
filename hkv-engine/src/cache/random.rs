//! Random victim-selection strategy: sample without replacement from the
//! tracked key set, per spec §4.4.

use hashbrown::HashSet;
use rand::seq::SliceRandom;
use rand::thread_rng;

use super::EvictionStrategy;

pub struct RandomStrategy {
    keys: Vec<Vec<u8>>,
    index: hashbrown::HashMap<Vec<u8>, usize>,
}

impl RandomStrategy {
    pub fn new() -> Self {
        RandomStrategy { keys: Vec::new(), index: hashbrown::HashMap::new() }
    }

    fn swap_remove(&mut self, idx: usize) {
        self.keys.swap_remove(idx);
        if let Some(moved) = self.keys.get(idx) {
            self.index.insert(moved.clone(), idx);
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionStrategy for RandomStrategy {
    fn on_access(&mut self, _key: &[u8]) {}

    fn on_insert(&mut self, key: &[u8]) {
        if self.index.contains_key(key) {
            return;
        }
        self.index.insert(key.to_vec(), self.keys.len());
        self.keys.push(key.to_vec());
    }

    fn on_delete(&mut self, key: &[u8]) {
        if let Some(idx) = self.index.remove(key) {
            self.swap_remove(idx);
        }
    }

    fn select_victims(&mut self, count: usize, volatile_only: bool, volatile_keys: &HashSet<Vec<u8>>) -> Vec<Vec<u8>> {
        let candidates: Vec<&Vec<u8>> = self
            .keys
            .iter()
            .filter(|k| !volatile_only || volatile_keys.contains(*k))
            .collect();
        let mut rng = thread_rng();
        let sample_size = count.min(candidates.len());
        let sampled: Vec<Vec<u8>> = candidates
            .choose_multiple(&mut rng, sample_size)
            .map(|k| (*k).clone())
            .collect();
        sampled
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_requested_count_without_duplicates() {
        let mut s = RandomStrategy::new();
        for k in [b"a".as_slice(), b"b", b"c", b"d"] {
            s.on_insert(k);
        }
        let victims = s.select_victims(2, false, &HashSet::new());
        assert_eq!(victims.len(), 2);
        let unique: HashSet<Vec<u8>> = victims.into_iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn respects_volatile_only_filter() {
        let mut s = RandomStrategy::new();
        s.on_insert(b"perm");
        s.on_insert(b"temp");
        let mut volatile = HashSet::new();
        volatile.insert(b"temp".to_vec());
        let victims = s.select_victims(5, true, &volatile);
        assert_eq!(victims, vec![b"temp".to_vec()]);
    }

    #[test]
    fn on_delete_removes_from_pool() {
        let mut s = RandomStrategy::new();
        s.on_insert(b"a");
        s.on_insert(b"b");
        s.on_delete(b"a");
        let victims = s.select_victims(10, false, &HashSet::new());
        assert_eq!(victims, vec![b"b".to_vec()]);
    }
}
