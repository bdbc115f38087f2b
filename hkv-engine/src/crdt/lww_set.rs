//! LWW-Element-Set: per-element last-writer-wins add/remove.

use hashbrown::HashMap;
use hkv_common::{HkvResult, HlcTimestamp};

use super::frame::{FrameReader, FrameWriter, TypeTag};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElementEntry {
    timestamp: HlcTimestamp,
    origin_node: u64,
    tombstone: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LwwSet {
    elements: HashMap<Vec<u8>, ElementEntry>,
}

impl LwwSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: Vec<u8>, timestamp: HlcTimestamp, origin_node: u64) {
        self.apply(element, timestamp, origin_node, false);
    }

    pub fn remove(&mut self, element: Vec<u8>, timestamp: HlcTimestamp, origin_node: u64) {
        self.apply(element, timestamp, origin_node, true);
    }

    fn apply(&mut self, element: Vec<u8>, timestamp: HlcTimestamp, origin_node: u64, tombstone: bool) {
        match self.elements.get_mut(&element) {
            Some(entry) if (timestamp, origin_node) >= (entry.timestamp, entry.origin_node) => {
                entry.timestamp = timestamp;
                entry.origin_node = origin_node;
                entry.tombstone = tombstone;
            }
            Some(_) => {}
            None => {
                self.elements.insert(element, ElementEntry { timestamp, origin_node, tombstone });
            }
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        self.elements.get(element).map(|e| !e.tombstone).unwrap_or(false)
    }

    pub fn elements(&self) -> impl Iterator<Item = &[u8]> {
        self.elements
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(k, _)| k.as_slice())
    }

    /// Per-element LWW merge: the greater `(timestamp, origin_node)` wins.
    pub fn merge(&mut self, other: &LwwSet) {
        for (element, other_entry) in other.elements.iter() {
            match self.elements.get_mut(element) {
                Some(entry) => {
                    if (other_entry.timestamp, other_entry.origin_node)
                        >= (entry.timestamp, entry.origin_node)
                    {
                        *entry = other_entry.clone();
                    }
                }
                None => {
                    self.elements.insert(element.clone(), other_entry.clone());
                }
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TypeTag::LwwSet);
        w.put_u64(self.elements.len() as u64);
        for (element, entry) in self.elements.iter() {
            w.put_bytes(element);
            w.put_i64(entry.timestamp.physical);
            w.put_u64(entry.timestamp.logical);
            w.put_u64(entry.origin_node);
            w.put_u8(entry.tombstone as u8);
        }
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> HkvResult<Self> {
        let mut r = FrameReader::new(payload);
        let count = r.get_u64()?;
        let mut elements = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let element = r.get_bytes()?;
            let physical = r.get_i64()?;
            let logical = r.get_u64()?;
            let origin_node = r.get_u64()?;
            let tombstone = r.get_u8()? != 0;
            elements.insert(
                element,
                ElementEntry {
                    timestamp: HlcTimestamp::new(physical, logical, origin_node),
                    origin_node,
                    tombstone,
                },
            );
        }
        Ok(LwwSet { elements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(physical: i64) -> HlcTimestamp {
        HlcTimestamp::new(physical, 0, 0)
    }

    #[test]
    fn add_then_contains() {
        let mut s = LwwSet::new();
        s.add(b"x".to_vec(), ts(1), 1);
        assert!(s.contains(b"x"));
    }

    #[test]
    fn remove_after_add_hides_element() {
        let mut s = LwwSet::new();
        s.add(b"x".to_vec(), ts(1), 1);
        s.remove(b"x".to_vec(), ts(2), 1);
        assert!(!s.contains(b"x"));
    }

    #[test]
    fn stale_remove_does_not_override_later_add() {
        let mut s = LwwSet::new();
        s.add(b"x".to_vec(), ts(5), 1);
        s.remove(b"x".to_vec(), ts(1), 1);
        assert!(s.contains(b"x"));
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = LwwSet::new();
        a.add(b"x".to_vec(), ts(1), 1);
        let mut b = LwwSet::new();
        b.add(b"y".to_vec(), ts(2), 2);
        b.remove(b"x".to_vec(), ts(3), 2);

        let (mut ab, mut ba) = (a.clone(), b.clone());
        ab.merge(&b);
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = LwwSet::new();
        a.add(b"x".to_vec(), ts(1), 1);
        let mut merged = a.clone();
        merged.merge(&a);
        assert_eq!(merged, a);
    }
}
