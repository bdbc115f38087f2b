//! LFU victim-selection strategy: frequency buckets plus a tracked
//! `min_freq`, per spec §4.4.

use hashbrown::HashMap;
use hashbrown::HashSet;
use indexmap::IndexSet;

use super::EvictionStrategy;

pub struct LfuStrategy {
    freq: HashMap<Vec<u8>, u64>,
    freq_to_keys: HashMap<u64, IndexSet<Vec<u8>>>,
    min_freq: u64,
}

impl LfuStrategy {
    pub fn new() -> Self {
        LfuStrategy { freq: HashMap::new(), freq_to_keys: HashMap::new(), min_freq: 0 }
    }

    fn bump(&mut self, key: &[u8]) {
        let current = match self.freq.get(key) {
            Some(&f) => f,
            None => return,
        };
        if let Some(bucket) = self.freq_to_keys.get_mut(&current) {
            bucket.shift_remove(key);
            if bucket.is_empty() && current == self.min_freq {
                self.min_freq += 1;
            }
        }
        let next = current + 1;
        self.freq.insert(key.to_vec(), next);
        self.freq_to_keys.entry(next).or_default().insert(key.to_vec());
    }
}

impl Default for LfuStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionStrategy for LfuStrategy {
    fn on_access(&mut self, key: &[u8]) {
        self.bump(key);
    }

    fn on_insert(&mut self, key: &[u8]) {
        if self.freq.contains_key(key) {
            return;
        }
        self.freq.insert(key.to_vec(), 1);
        self.freq_to_keys.entry(1).or_default().insert(key.to_vec());
        self.min_freq = 1;
    }

    fn on_delete(&mut self, key: &[u8]) {
        if let Some(f) = self.freq.remove(key) {
            if let Some(bucket) = self.freq_to_keys.get_mut(&f) {
                bucket.shift_remove(key);
            }
        }
    }

    fn select_victims(&mut self, count: usize, volatile_only: bool, volatile_keys: &HashSet<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut victims = Vec::with_capacity(count);
        let mut freqs: Vec<u64> = self.freq_to_keys.keys().copied().collect();
        freqs.sort_unstable();
        for f in freqs {
            if victims.len() >= count {
                break;
            }
            if let Some(bucket) = self.freq_to_keys.get(&f) {
                for key in bucket.iter() {
                    if victims.len() >= count {
                        break;
                    }
                    if !volatile_only || volatile_keys.contains(key) {
                        victims.push(key.clone());
                    }
                }
            }
        }
        victims
    }

    fn clear(&mut self) {
        self.freq.clear();
        self.freq_to_keys.clear();
        self.min_freq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_frequent_selected_first() {
        let mut s = LfuStrategy::new();
        s.on_insert(b"a");
        s.on_insert(b"b");
        s.on_access(b"a");
        s.on_access(b"a");
        let victims = s.select_victims(1, false, &HashSet::new());
        assert_eq!(victims, vec![b"b".to_vec()]);
    }

    #[test]
    fn min_freq_advances_when_bucket_empties() {
        let mut s = LfuStrategy::new();
        s.on_insert(b"a");
        s.on_access(b"a");
        assert_eq!(s.min_freq, 2);
    }
}
