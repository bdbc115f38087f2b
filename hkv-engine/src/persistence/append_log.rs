//! The append-only operation log (spec §4.6(a)): every mutation is recorded
//! before it is considered durable, in binary form, with a CRC32 trailer per
//! record so a torn write (partial record left by a crash mid-`write`) is
//! detectable and truncated away on recovery rather than corrupting state.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use hkv_common::config::FsyncPolicy;
use hkv_common::{HkvError, HkvResult, HlcTimestamp};

/// The mutation kinds replayed during recovery. Distinct from
/// [`crate::crdt::CrdtKind`]: this tags the *operation*, not the value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Set,
    Delete,
    CrdtAdd,
    CrdtRemove,
    CrdtIncrement,
    CrdtDecrement,
    Expire,
    Persist,
}

impl LogOp {
    fn to_byte(self) -> u8 {
        match self {
            LogOp::Set => 1,
            LogOp::Delete => 2,
            LogOp::CrdtAdd => 3,
            LogOp::CrdtRemove => 4,
            LogOp::CrdtIncrement => 5,
            LogOp::CrdtDecrement => 6,
            LogOp::Expire => 7,
            LogOp::Persist => 8,
        }
    }

    fn from_byte(b: u8) -> HkvResult<Self> {
        Ok(match b {
            1 => LogOp::Set,
            2 => LogOp::Delete,
            3 => LogOp::CrdtAdd,
            4 => LogOp::CrdtRemove,
            5 => LogOp::CrdtIncrement,
            6 => LogOp::CrdtDecrement,
            7 => LogOp::Expire,
            8 => LogOp::Persist,
            other => return Err(HkvError::invalid_argument(format!("unknown log op tag {other}"))),
        })
    }
}

/// One durable record. `value` carries an encoded [`crate::crdt::CrdtValue`]
/// frame for `Set`, a raw set-element for `CrdtAdd`/`CrdtRemove`, and an
/// 8-byte little-endian amount for `CrdtIncrement`/`CrdtDecrement`; it is
/// unused for `Delete`/`Expire`/`Persist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub seq: u64,
    pub op: LogOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub node_id: u64,
    pub timestamp: HlcTimestamp,
    pub ttl_millis: Option<u64>,
}

impl LogRecord {
    /// Encodes the record body (everything the CRC covers) followed by the
    /// 4-byte CRC32 trailer.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.key.len() + self.value.as_ref().map_or(0, |v| v.len()));
        body.extend_from_slice(&self.seq.to_le_bytes());
        body.push(self.op.to_byte());
        body.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.key);
        match &self.value {
            Some(v) => {
                body.push(1);
                body.extend_from_slice(&(v.len() as u32).to_le_bytes());
                body.extend_from_slice(v);
            }
            None => body.push(0),
        }
        body.extend_from_slice(&self.node_id.to_le_bytes());
        body.extend_from_slice(&self.timestamp.physical.to_le_bytes());
        body.extend_from_slice(&self.timestamp.logical.to_le_bytes());
        body.extend_from_slice(&self.timestamp.node_id.to_le_bytes());
        match self.ttl_millis {
            Some(ms) => {
                body.push(1);
                body.extend_from_slice(&ms.to_le_bytes());
            }
            None => body.push(0),
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = body;
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes exactly one record from the front of `bytes`, returning it
    /// plus the number of bytes consumed. A truncated buffer (not enough
    /// bytes for a full record) or a CRC mismatch both yield `None` rather
    /// than an error: both mean "stop replaying here", the expected shape
    /// of a crash mid-append.
    pub fn decode(bytes: &[u8]) -> HkvResult<Option<(Self, usize)>> {
        let mut cursor = 0usize;
        macro_rules! take {
            ($n:expr) => {{
                if bytes.len() < cursor + $n {
                    return Ok(None);
                }
                let slice = &bytes[cursor..cursor + $n];
                cursor += $n;
                slice
            }};
        }

        let seq = u64::from_le_bytes(take!(8).try_into().unwrap());
        let op_byte = take!(1)[0];
        let op = match LogOp::from_byte(op_byte) {
            Ok(op) => op,
            Err(_) => return Ok(None),
        };
        let key_len = u32::from_le_bytes(take!(4).try_into().unwrap()) as usize;
        let key = take!(key_len).to_vec();
        let has_value = take!(1)[0];
        let value = if has_value == 1 {
            let value_len = u32::from_le_bytes(take!(4).try_into().unwrap()) as usize;
            Some(take!(value_len).to_vec())
        } else {
            None
        };
        let node_id = u64::from_le_bytes(take!(8).try_into().unwrap());
        let physical = i64::from_le_bytes(take!(8).try_into().unwrap());
        let logical = u64::from_le_bytes(take!(8).try_into().unwrap());
        let ts_node_id = u64::from_le_bytes(take!(8).try_into().unwrap());
        let has_ttl = take!(1)[0];
        let ttl_millis = if has_ttl == 1 {
            Some(u64::from_le_bytes(take!(8).try_into().unwrap()))
        } else {
            None
        };
        let body_len = cursor;
        let crc_stored = u32::from_le_bytes(take!(4).try_into().unwrap());

        let mut hasher = Crc32::new();
        hasher.update(&bytes[..body_len]);
        if hasher.finalize() != crc_stored {
            return Ok(None);
        }

        Ok(Some((
            LogRecord {
                seq,
                op,
                key,
                value,
                node_id,
                timestamp: HlcTimestamp::new(physical, logical, ts_node_id),
                ttl_millis,
            },
            cursor,
        )))
    }
}

/// Appends records to a single log segment file and applies the configured
/// fsync policy. `Everysec` does not spawn its own timer here — the server's
/// background task set calls [`AppendLogWriter::flush`] on an interval
/// (spec §2.4's background task table), keeping this type free of any
/// runtime dependency.
pub struct AppendLogWriter {
    writer: BufWriter<File>,
    fsync_policy: FsyncPolicy,
    next_seq: u64,
    dirty: bool,
}

impl AppendLogWriter {
    pub fn create(path: &Path, fsync_policy: FsyncPolicy, starting_seq: u64) -> HkvResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AppendLogWriter {
            writer: BufWriter::new(file),
            fsync_policy,
            next_seq: starting_seq,
            dirty: false,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Appends one record, assigning it the next sequence number. Returns
    /// the assigned sequence number.
    pub fn append(
        &mut self,
        op: LogOp,
        key: &[u8],
        value: Option<Vec<u8>>,
        node_id: u64,
        timestamp: HlcTimestamp,
        ttl_millis: Option<u64>,
    ) -> HkvResult<u64> {
        let seq = self.next_seq;
        let record = LogRecord { seq, op, key: key.to_vec(), value, node_id, timestamp, ttl_millis };
        self.writer.write_all(&record.encode())?;
        self.next_seq += 1;
        self.dirty = true;
        if self.fsync_policy == FsyncPolicy::Always {
            self.flush()?;
        }
        Ok(seq)
    }

    /// Flushes buffered writes and, unless the policy is `No`, fsyncs to
    /// disk. Called after every `append` under `Always`, and periodically
    /// by the caller under `Everysec`.
    pub fn flush(&mut self) -> HkvResult<()> {
        self.writer.flush()?;
        if self.fsync_policy != FsyncPolicy::No {
            self.writer.get_ref().sync_data()?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn has_unflushed_writes(&self) -> bool {
        self.dirty
    }
}

/// Reads every well-formed record from a log segment, stopping at the first
/// truncated or CRC-mismatched record rather than erroring out (spec §4.6
/// recovery: "drop corrupt trailing records").
pub fn read_all(path: &Path) -> HkvResult<Vec<LogRecord>> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        match LogRecord::decode(&buf[offset..])? {
            Some((record, consumed)) => {
                offset += consumed;
                records.push(record);
            }
            None => break,
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> HlcTimestamp {
        HlcTimestamp::new(10, 1, 1)
    }

    #[test]
    fn record_roundtrips_through_encode_decode() {
        let record = LogRecord {
            seq: 42,
            op: LogOp::Set,
            key: b"k".to_vec(),
            value: Some(b"payload".to_vec()),
            node_id: 1,
            timestamp: ts(),
            ttl_millis: Some(5_000),
        };
        let bytes = record.encode();
        let (decoded, consumed) = LogRecord::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn truncated_record_decodes_to_none() {
        let record = LogRecord {
            seq: 1,
            op: LogOp::Delete,
            key: b"k".to_vec(),
            value: None,
            node_id: 1,
            timestamp: ts(),
            ttl_millis: None,
        };
        let bytes = record.encode();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(LogRecord::decode(truncated).unwrap().is_none());
    }

    #[test]
    fn corrupted_crc_decodes_to_none() {
        let record = LogRecord {
            seq: 1,
            op: LogOp::Delete,
            key: b"k".to_vec(),
            value: None,
            node_id: 1,
            timestamp: ts(),
            ttl_millis: None,
        };
        let mut bytes = record.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(LogRecord::decode(&bytes).unwrap().is_none());
    }

    #[test]
    fn writer_then_read_all_recovers_records() {
        let dir = std::env::temp_dir().join(format!("hyperkv-alog-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("appendlog-0.log");

        {
            let mut writer = AppendLogWriter::create(&path, FsyncPolicy::No, 0).unwrap();
            writer.append(LogOp::Set, b"a", Some(b"1".to_vec()), 1, ts(), None).unwrap();
            writer.append(LogOp::Set, b"b", Some(b"2".to_vec()), 1, ts(), Some(1_000)).unwrap();
            writer.flush().unwrap();
        }

        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, b"a");
        assert_eq!(records[1].ttl_millis, Some(1_000));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_all_stops_at_trailing_garbage() {
        let dir = std::env::temp_dir().join(format!("hyperkv-alog-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("appendlog-0.log");

        let record = LogRecord {
            seq: 0,
            op: LogOp::Set,
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
            node_id: 1,
            timestamp: ts(),
            ttl_millis: None,
        };
        let mut bytes = record.encode();
        bytes.extend_from_slice(&[0xAB, 0xCD, 0xEF]);
        std::fs::write(&path, &bytes).unwrap();

        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
