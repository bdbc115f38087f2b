//! PN-Counter: two per-node G-Counters (increments and decrements) combined
//! by subtraction, merged by pointwise max.

use hashbrown::HashMap;
use hkv_common::HkvResult;

use super::frame::{FrameReader, FrameWriter, TypeTag};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PnCounter {
    inc: HashMap<u64, u64>,
    dec: HashMap<u64, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, node_id: u64, amount: u64) {
        *self.inc.entry(node_id).or_insert(0) += amount;
    }

    pub fn decrement(&mut self, node_id: u64, amount: u64) {
        *self.dec.entry(node_id).or_insert(0) += amount;
    }

    pub fn value(&self) -> i64 {
        let total_inc: u64 = self.inc.values().sum();
        let total_dec: u64 = self.dec.values().sum();
        total_inc as i64 - total_dec as i64
    }

    pub fn merge(&mut self, other: &PnCounter) {
        merge_pointwise_max(&mut self.inc, &other.inc);
        merge_pointwise_max(&mut self.dec, &other.dec);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TypeTag::PnCounter);
        encode_map(&mut w, &self.inc);
        encode_map(&mut w, &self.dec);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> HkvResult<Self> {
        let mut r = FrameReader::new(payload);
        let inc = decode_map(&mut r)?;
        let dec = decode_map(&mut r)?;
        Ok(PnCounter { inc, dec })
    }
}

fn merge_pointwise_max(target: &mut HashMap<u64, u64>, other: &HashMap<u64, u64>) {
    for (&node, &count) in other.iter() {
        let slot = target.entry(node).or_insert(0);
        *slot = (*slot).max(count);
    }
}

fn encode_map(w: &mut FrameWriter, map: &HashMap<u64, u64>) {
    w.put_u64(map.len() as u64);
    for (&node, &count) in map.iter() {
        w.put_u64(node);
        w.put_u64(count);
    }
}

fn decode_map(r: &mut FrameReader) -> HkvResult<HashMap<u64, u64>> {
    let count = r.get_u64()?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let node = r.get_u64()?;
        let value = r.get_u64()?;
        map.insert(node, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_decrement() {
        let mut c = PnCounter::new();
        c.increment(1, 5);
        c.increment(1, 3);
        assert_eq!(c.value(), 8);
    }

    #[test]
    fn merge_combines_nodes() {
        let mut a = PnCounter::new();
        a.increment(1, 5);
        a.increment(1, 3);

        let mut b = PnCounter::new();
        b.decrement(2, 2);

        let mut merged_a = a.clone();
        merged_a.merge(&b);
        assert_eq!(merged_a.value(), 6);

        let mut merged_b = b.clone();
        merged_b.merge(&a);
        assert_eq!(merged_b.value(), 6);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = PnCounter::new();
        a.increment(1, 5);
        let mut merged = a.clone();
        merged.merge(&a);
        assert_eq!(merged, a);
    }

    #[test]
    fn merge_is_associative() {
        let mut a = PnCounter::new();
        a.increment(1, 5);
        let mut b = PnCounter::new();
        b.increment(2, 3);
        let mut c = PnCounter::new();
        c.decrement(3, 1);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left, right);
    }
}
