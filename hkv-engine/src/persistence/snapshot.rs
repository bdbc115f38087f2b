//! Point-in-time snapshots (spec §4.6(b)): a full dump of live state plus
//! enough clock metadata to resume the Hybrid Logical Clock and append log
//! correctly after loading one. Written to a temp file and renamed into
//! place atomically so a crash mid-write never leaves a half-written
//! snapshot at its final path.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crc32fast::Hasher as Crc32;
use hkv_common::{HkvError, HkvResult};

use super::write_atomic;

const SNAPSHOT_VERSION: u8 = 1;

/// Snapshot header: enough to restore the HLC and know which append-log
/// sequence number the recorded state is current as of (recovery replays
/// only records with `seq > log_seq_watermark`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u8,
    pub node_id: u64,
    pub hlc_physical: i64,
    pub hlc_logical: u64,
    pub creation_time_millis: u64,
    pub log_seq_watermark: u64,
    pub entry_count: u32,
}

impl SnapshotHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 8 + 8 + 8 + 4);
        buf.push(self.version);
        buf.extend_from_slice(&self.node_id.to_le_bytes());
        buf.extend_from_slice(&self.hlc_physical.to_le_bytes());
        buf.extend_from_slice(&self.hlc_logical.to_le_bytes());
        buf.extend_from_slice(&self.creation_time_millis.to_le_bytes());
        buf.extend_from_slice(&self.log_seq_watermark.to_le_bytes());
        buf.extend_from_slice(&self.entry_count.to_le_bytes());
        buf
    }

    const ENCODED_LEN: usize = 1 + 8 + 8 + 8 + 8 + 8 + 4;

    fn decode(bytes: &[u8]) -> HkvResult<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(HkvError::invalid_argument("snapshot header truncated"));
        }
        let version = bytes[0];
        if version != SNAPSHOT_VERSION {
            return Err(HkvError::invalid_argument(format!("unsupported snapshot version {version}")));
        }
        let mut off = 1;
        let take8 = |bytes: &[u8], off: &mut usize| {
            let v = u64::from_le_bytes(bytes[*off..*off + 8].try_into().unwrap());
            *off += 8;
            v
        };
        let node_id = take8(bytes, &mut off);
        let hlc_physical = take8(bytes, &mut off) as i64;
        let hlc_logical = take8(bytes, &mut off);
        let creation_time_millis = take8(bytes, &mut off);
        let log_seq_watermark = take8(bytes, &mut off);
        let entry_count = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        Ok(SnapshotHeader {
            version,
            node_id,
            hlc_physical,
            hlc_logical,
            creation_time_millis,
            log_seq_watermark,
            entry_count,
        })
    }
}

/// One snapshotted entry: which shard it belongs to (so recovery can
/// restore it without re-hashing, and to detect a shard-count mismatch
/// between the snapshot and the running config), the key, the encoded CRDT
/// value frame (see [`crate::crdt::CrdtValue::encode`]), and its remaining
/// TTL in milliseconds at snapshot time, if any.
pub struct SnapshotEntry {
    pub shard_id: u32,
    pub key: Vec<u8>,
    pub value_frame: Vec<u8>,
    pub ttl_millis: Option<u64>,
}

impl SnapshotEntry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 4 + self.key.len() + 4 + self.value_frame.len() + 9);
        buf.extend_from_slice(&self.shard_id.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value_frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value_frame);
        match self.ttl_millis {
            Some(ms) => {
                buf.push(1);
                buf.extend_from_slice(&ms.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    fn decode(bytes: &[u8], offset: &mut usize) -> HkvResult<Self> {
        let need = |o: usize, n: usize| -> HkvResult<()> {
            if bytes.len() < o + n {
                Err(HkvError::invalid_argument("snapshot entry truncated"))
            } else {
                Ok(())
            }
        };

        need(*offset, 4)?;
        let shard_id = u32::from_le_bytes(bytes[*offset..*offset + 4].try_into().unwrap());
        *offset += 4;

        need(*offset, 4)?;
        let key_len = u32::from_le_bytes(bytes[*offset..*offset + 4].try_into().unwrap()) as usize;
        *offset += 4;
        need(*offset, key_len)?;
        let key = bytes[*offset..*offset + key_len].to_vec();
        *offset += key_len;

        need(*offset, 4)?;
        let value_len = u32::from_le_bytes(bytes[*offset..*offset + 4].try_into().unwrap()) as usize;
        *offset += 4;
        need(*offset, value_len)?;
        let value_frame = bytes[*offset..*offset + value_len].to_vec();
        *offset += value_len;

        need(*offset, 1)?;
        let has_ttl = bytes[*offset];
        *offset += 1;
        let ttl_millis = if has_ttl == 1 {
            need(*offset, 8)?;
            let ms = u64::from_le_bytes(bytes[*offset..*offset + 8].try_into().unwrap());
            *offset += 8;
            Some(ms)
        } else {
            None
        };

        Ok(SnapshotEntry { shard_id, key, value_frame, ttl_millis })
    }
}

pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Builds the full snapshot body (header then entries) and writes it to
    /// `path` via a temp-file-then-rename, with a trailing CRC32 covering
    /// the whole body for corruption detection on load.
    pub fn write(path: &Path, node_id: u64, hlc_physical: i64, hlc_logical: u64, creation_time_millis: u64, log_seq_watermark: u64, entries: &[SnapshotEntry]) -> HkvResult<()> {
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            node_id,
            hlc_physical,
            hlc_logical,
            creation_time_millis,
            log_seq_watermark,
            entry_count: entries.len() as u32,
        };

        let mut body = header.encode();
        for entry in entries {
            body.extend_from_slice(&entry.encode());
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();
        body.extend_from_slice(&crc.to_le_bytes());

        write_atomic(path, &body)
    }
}

pub struct SnapshotReader;

impl SnapshotReader {
    pub fn read(path: &Path) -> HkvResult<(SnapshotHeader, Vec<SnapshotEntry>)> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.len() < 4 {
            return Err(HkvError::invalid_argument("snapshot file too short"));
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(HkvError::invalid_argument("snapshot CRC mismatch, file is corrupt"));
        }

        let header = SnapshotHeader::decode(body)?;
        let mut offset = SnapshotHeader::ENCODED_LEN;
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            entries.push(SnapshotEntry::decode(body, &mut offset)?);
        }

        Ok((header, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("hyperkv-snap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn header_and_entries_roundtrip() {
        let path = temp_path("a.snap");
        let entries = vec![
            SnapshotEntry { shard_id: 0, key: b"k1".to_vec(), value_frame: b"frame1".to_vec(), ttl_millis: None },
            SnapshotEntry { shard_id: 2, key: b"k2".to_vec(), value_frame: b"frame2".to_vec(), ttl_millis: Some(9_000) },
        ];
        SnapshotWriter::write(&path, 7, 100, 3, 1_700_000_000, 42, &entries).unwrap();

        let (header, loaded) = SnapshotReader::read(&path).unwrap();
        assert_eq!(header.node_id, 7);
        assert_eq!(header.hlc_physical, 100);
        assert_eq!(header.log_seq_watermark, 42);
        assert_eq!(header.entry_count, 2);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].key, b"k1");
        assert_eq!(loaded[1].ttl_millis, Some(9_000));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let path = temp_path("b.snap");
        SnapshotWriter::write(&path, 1, 0, 0, 0, 0, &[]).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = SnapshotReader::read(&path).unwrap_err();
        assert_eq!(err.kind(), hkv_common::ErrorKind::InvalidArgument);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn empty_snapshot_roundtrips() {
        let path = temp_path("c.snap");
        SnapshotWriter::write(&path, 1, 0, 0, 0, 0, &[]).unwrap();
        let (header, entries) = SnapshotReader::read(&path).unwrap();
        assert_eq!(header.entry_count, 0);
        assert!(entries.is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
