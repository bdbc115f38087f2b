//! Observed-Remove Set: each add mints a unique tag; remove deletes only the
//! tags it has observed, so a concurrent add cannot be resurrected by a race
//! with an older remove.

use hashbrown::{HashMap, HashSet};
use hkv_common::HkvResult;
use uuid::Uuid;

use super::frame::{FrameReader, FrameWriter, TypeTag};

pub type Tag = u128;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrSet {
    added: HashMap<Vec<u8>, HashSet<Tag>>,
    removed: HashMap<Vec<u8>, HashSet<Tag>>,
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `element`, minting a fresh unique tag for this observation.
    pub fn add(&mut self, element: Vec<u8>) {
        let tag = Uuid::new_v4().as_u128();
        self.added.entry(element).or_default().insert(tag);
    }

    /// Removes `element` by copying every tag currently observed in `added`
    /// into `removed`. Tags added concurrently elsewhere are unaffected.
    pub fn remove(&mut self, element: &[u8]) {
        if let Some(tags) = self.added.get(element) {
            let observed: HashSet<Tag> = tags.clone();
            self.removed.entry(element.to_vec()).or_default().extend(observed);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        match self.added.get(element) {
            Some(tags) => {
                let removed = self.removed.get(element);
                tags.iter().any(|t| removed.map(|r| !r.contains(t)).unwrap_or(true))
            }
            None => false,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.added.keys().filter(|e| self.contains(e)).map(|k| k.as_slice())
    }

    /// Union of `added` and `removed` tag-sets per element.
    pub fn merge(&mut self, other: &OrSet) {
        for (element, tags) in other.added.iter() {
            self.added.entry(element.clone()).or_default().extend(tags.iter().copied());
        }
        for (element, tags) in other.removed.iter() {
            self.removed.entry(element.clone()).or_default().extend(tags.iter().copied());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TypeTag::OrSet);
        encode_tag_map(&mut w, &self.added);
        encode_tag_map(&mut w, &self.removed);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> HkvResult<Self> {
        let mut r = FrameReader::new(payload);
        let added = decode_tag_map(&mut r)?;
        let removed = decode_tag_map(&mut r)?;
        Ok(OrSet { added, removed })
    }
}

fn encode_tag_map(w: &mut FrameWriter, map: &HashMap<Vec<u8>, HashSet<Tag>>) {
    w.put_u64(map.len() as u64);
    for (element, tags) in map.iter() {
        w.put_bytes(element);
        w.put_u64(tags.len() as u64);
        for tag in tags {
            w.put_u64((*tag >> 64) as u64);
            w.put_u64(*tag as u64);
        }
    }
}

fn decode_tag_map(r: &mut FrameReader) -> HkvResult<HashMap<Vec<u8>, HashSet<Tag>>> {
    let count = r.get_u64()?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let element = r.get_bytes()?;
        let tag_count = r.get_u64()?;
        let mut tags = HashSet::with_capacity(tag_count as usize);
        for _ in 0..tag_count {
            let hi = r.get_u64()? as u128;
            let lo = r.get_u64()? as u128;
            tags.insert((hi << 64) | lo);
        }
        map.insert(element, tags);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let mut s = OrSet::new();
        s.add(b"x".to_vec());
        assert!(s.contains(b"x"));
    }

    #[test]
    fn remove_hides_observed_tags() {
        let mut s = OrSet::new();
        s.add(b"x".to_vec());
        s.remove(b"x");
        assert!(!s.contains(b"x"));
    }

    #[test]
    fn concurrent_add_survives_remote_remove() {
        let mut a = OrSet::new();
        a.add(b"x".to_vec());

        let mut b = a.clone();
        b.remove(b"x"); // b observes and removes a's tag

        // meanwhile a adds again concurrently, minting a fresh tag
        a.add(b"x".to_vec());

        let mut merged = a.clone();
        merged.merge(&b);
        // a's second add tag was never observed by b's remove, so it survives
        assert!(merged.contains(b"x"));
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = OrSet::new();
        a.add(b"x".to_vec());
        let mut b = OrSet::new();
        b.add(b"y".to_vec());

        let (mut ab, mut ba) = (a.clone(), b.clone());
        ab.merge(&b);
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = OrSet::new();
        a.add(b"x".to_vec());
        let mut merged = a.clone();
        merged.merge(&a);
        assert_eq!(merged, a);
    }
}
