//! Last-writer-wins register: a single value resolved by HLC timestamp.

use hkv_common::HlcTimestamp;

use super::frame::{FrameReader, FrameWriter, TypeTag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwRegister {
    value: Vec<u8>,
    timestamp: HlcTimestamp,
    origin_node: u64,
    /// A register that has been explicitly deleted keeps its timestamp so a
    /// concurrent older `set` does not resurrect it, but reads see nothing.
    tombstone: bool,
}

impl LwwRegister {
    pub fn new(value: Vec<u8>, timestamp: HlcTimestamp, origin_node: u64) -> Self {
        LwwRegister { value, timestamp, origin_node, tombstone: false }
    }

    /// `set(v)` per spec §4.2: always evaluated against the current
    /// timestamp by the same LWW tie-break rule as `merge`.
    pub fn set(&mut self, value: Vec<u8>, timestamp: HlcTimestamp, origin_node: u64) {
        if wins(timestamp, origin_node, self.timestamp, self.origin_node) {
            self.value = value;
            self.timestamp = timestamp;
            self.origin_node = origin_node;
            self.tombstone = false;
        }
    }

    pub fn delete(&mut self, timestamp: HlcTimestamp, origin_node: u64) {
        if wins(timestamp, origin_node, self.timestamp, self.origin_node) {
            self.value.clear();
            self.timestamp = timestamp;
            self.origin_node = origin_node;
            self.tombstone = true;
        }
    }

    /// `get()`: returns nothing for a tombstoned register (spec §9 open
    /// question, resolved: tombstoned registers read as absent).
    pub fn get(&self) -> Option<&[u8]> {
        if self.tombstone { None } else { Some(&self.value) }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    pub fn timestamp(&self) -> HlcTimestamp {
        self.timestamp
    }

    /// Keep the entry whose `(timestamp, origin_node)` is greater.
    pub fn merge(&mut self, other: &LwwRegister) {
        if wins(other.timestamp, other.origin_node, self.timestamp, self.origin_node) {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.origin_node = other.origin_node;
            self.tombstone = other.tombstone;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new(TypeTag::LwwRegister);
        w.put_i64(self.timestamp.physical);
        w.put_u64(self.timestamp.logical);
        w.put_u64(self.origin_node);
        w.put_u8(self.tombstone as u8);
        w.put_bytes(&self.value);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> hkv_common::HkvResult<Self> {
        let mut r = FrameReader::new(payload);
        let physical = r.get_i64()?;
        let logical = r.get_u64()?;
        let origin_node = r.get_u64()?;
        let tombstone = r.get_u8()? != 0;
        let value = r.get_bytes()?;
        Ok(LwwRegister {
            value,
            timestamp: HlcTimestamp::new(physical, logical, origin_node),
            origin_node,
            tombstone,
        })
    }
}

/// `(ts, node)` wins over `(other_ts, other_node)` per spec §4.1: greater HLC
/// timestamp; ties on equal `(physical, logical)` break on greater node_id.
fn wins(ts: HlcTimestamp, node: u64, other_ts: HlcTimestamp, other_node: u64) -> bool {
    (ts, node) >= (other_ts, other_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(physical: i64, logical: u64) -> HlcTimestamp {
        HlcTimestamp::new(physical, logical, 0)
    }

    #[test]
    fn later_write_wins() {
        let mut a = LwwRegister::new(b"a".to_vec(), ts(1, 0), 1);
        a.set(b"b".to_vec(), ts(2, 0), 1);
        assert_eq!(a.get(), Some(&b"b"[..]));
    }

    #[test]
    fn earlier_write_loses() {
        let mut a = LwwRegister::new(b"a".to_vec(), ts(5, 0), 1);
        a.set(b"b".to_vec(), ts(2, 0), 1);
        assert_eq!(a.get(), Some(&b"a"[..]));
    }

    #[test]
    fn tie_breaks_on_node_id() {
        let mut a = LwwRegister::new(b"a".to_vec(), ts(1, 0), 1);
        a.set(b"b".to_vec(), ts(1, 0), 2);
        assert_eq!(a.get(), Some(&b"b"[..]));
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = LwwRegister::new(b"a".to_vec(), ts(1, 0), 1);
        let mut b = LwwRegister::new(b"b".to_vec(), ts(2, 0), 2);
        let (mut x, mut y) = (a.clone(), b.clone());
        x.merge(&b);
        y.merge(&a);
        assert_eq!(x, y);
        let _ = (&mut a, &mut b);
    }

    #[test]
    fn merge_is_idempotent() {
        let a = LwwRegister::new(b"a".to_vec(), ts(1, 0), 1);
        let mut merged = a.clone();
        merged.merge(&a);
        assert_eq!(merged, a);
    }

    #[test]
    fn deleted_register_reads_as_absent() {
        let mut a = LwwRegister::new(b"a".to_vec(), ts(1, 0), 1);
        a.delete(ts(2, 0), 1);
        assert_eq!(a.get(), None);
        assert!(a.is_tombstone());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let a = LwwRegister::new(b"value".to_vec(), ts(10, 3), 7);
        let bytes = a.encode();
        let (_, payload) = super::super::frame::split_header(&bytes).unwrap();
        let decoded = LwwRegister::decode(payload).unwrap();
        assert_eq!(decoded, a);
    }
}
