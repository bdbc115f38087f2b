//! Byte-level encoding for CRDT value frames.
//!
//! Each frame starts with a version byte (currently `1`) followed by a type
//! tag, then variant-specific fields. Numeric fields are fixed-width
//! little-endian; byte strings are length-prefixed with a `u32`. Any future
//! variant adds a tag rather than reusing one, so old frames stay readable.

use hkv_common::{HkvError, HkvResult};

pub const FRAME_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    LwwRegister = 1,
    LwwSet = 2,
    OrSet = 3,
    PnCounter = 4,
}

impl TypeTag {
    pub fn from_byte(b: u8) -> HkvResult<Self> {
        match b {
            1 => Ok(TypeTag::LwwRegister),
            2 => Ok(TypeTag::LwwSet),
            3 => Ok(TypeTag::OrSet),
            4 => Ok(TypeTag::PnCounter),
            other => Err(HkvError::type_mismatch("known crdt tag", tag_name(other))),
        }
    }
}

fn tag_name(b: u8) -> &'static str {
    match b {
        1 => "lww_register",
        2 => "lww_set",
        3 => "or_set",
        4 => "pn_counter",
        _ => "unknown",
    }
}

/// Append-only byte writer used while encoding a frame.
#[derive(Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new(tag: TypeTag) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(FRAME_VERSION);
        buf.push(tag as u8);
        FrameWriter { buf }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based reader over an encoded frame's payload (version/tag already
/// consumed by the caller).
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> HkvResult<()> {
        if self.pos + n > self.buf.len() {
            Err(HkvError::invalid_argument("truncated crdt frame"))
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> HkvResult<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u64(&mut self) -> HkvResult<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_i64(&mut self) -> HkvResult<i64> {
        self.need(8)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_bytes(&mut self) -> HkvResult<Vec<u8>> {
        self.need(4)?;
        let len = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        self.need(len)?;
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Parses the version + type tag header shared by every frame, returning the
/// tag and the remaining payload.
pub fn split_header(frame: &[u8]) -> HkvResult<(TypeTag, &[u8])> {
    if frame.len() < 2 {
        return Err(HkvError::invalid_argument("crdt frame too short"));
    }
    if frame[0] != FRAME_VERSION {
        return Err(HkvError::invalid_argument(format!(
            "unsupported crdt frame version {}",
            frame[0]
        )));
    }
    let tag = TypeTag::from_byte(frame[1])?;
    Ok((tag, &frame[2..]))
}
