//! # RESP2 Incremental Parser
//!
//! Purpose: parse RESP2 command arrays out of a growable `BytesMut` as bytes
//! arrive off the socket, without blocking for a full frame. Only the
//! command-array shape is accepted (`*N\r\n$len\r\n...`) since every
//! operation this front end dispatches is a flat argument list — full RESP2
//! coverage (nested arrays, inline commands) is explicitly out of scope
//! (spec.md §1 Non-goals).
//!
//! ## Design Principles
//! 1. **Incremental**: `parse` never blocks; it returns `Ok(None)` when the
//!    buffer doesn't yet hold a full command and waits for more bytes.
//! 2. **Binary-safe**: bulk string payloads are treated as raw bytes.
//! 3. **Fail fast**: malformed framing is a protocol error, not a silent skip.

use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

/// Incremental parser state. Stateless between successful parses: each
/// `parse` call starts fresh from the buffer's current read position.
#[derive(Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Attempts to parse one full command array from `buf`, advancing past
    /// it on success. Returns `Ok(None)` if the buffer holds an incomplete
    /// command (caller should read more bytes and retry).
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut cursor = 0usize;
        let count = match read_line_prefixed(buf, &mut cursor, b'*')? {
            Some(n) => n,
            None => return Ok(None),
        };
        if count < 0 {
            buf.advance(cursor);
            return Ok(Some(Vec::new()));
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = match read_line_prefixed(buf, &mut cursor, b'$')? {
                Some(n) => n,
                None => return Ok(None),
            };
            if len < 0 {
                args.push(Vec::new());
                continue;
            }
            let len = len as usize;
            if buf.len() < cursor + len + 2 {
                return Ok(None);
            }
            let data = buf[cursor..cursor + len].to_vec();
            cursor += len;
            if &buf[cursor..cursor + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            cursor += 2;
            args.push(data);
        }

        buf.advance(cursor);
        Ok(Some(args))
    }
}

/// Reads one `<prefix><integer>\r\n` line starting at `*cursor`, without
/// consuming it from `buf` (the caller advances once a whole command is
/// parsed). Returns `Ok(None)` if the line isn't complete yet.
fn read_line_prefixed(buf: &BytesMut, cursor: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    let start = *cursor;
    if buf.len() <= start {
        return Ok(None);
    }
    if buf[start] != prefix {
        return Err(RespError::Protocol);
    }
    let Some(nl) = buf[start..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line_end = start + nl;
    if line_end == start || buf[line_end - 1] != b'\r' {
        return Err(RespError::Protocol);
    }
    let digits = &buf[start + 1..line_end - 1];
    let value = parse_i64(digits)?;
    *cursor = line_end + 1;
    Ok(Some(value))
}

fn parse_i64(data: &[u8]) -> Result<i64, RespError> {
    if data.is_empty() {
        return Err(RespError::Protocol);
    }
    let (negative, digits) = if data[0] == b'-' { (true, &data[1..]) } else { (false, data) };
    if digits.is_empty() {
        return Err(RespError::Protocol);
    }
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }
    Ok(if negative { -value } else { value })
}

pub fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.push(b'+');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b':');
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'*');
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&resp_bulk(&item));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_command() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"[..]);
        let mut parser = RespParser::new();
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_command_yields_none_without_consuming() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n"[..]);
        let mut parser = RespParser::new();
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &b"*2\r\n$3\r\nGET\r\n"[..]);
    }

    #[test]
    fn parses_two_commands_back_to_back() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        let mut parser = RespParser::new();
        let first = parser.parse(&mut buf).unwrap().unwrap();
        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first, vec![b"PING".to_vec()]);
        assert_eq!(second, vec![b"PING".to_vec()]);
    }

    #[test]
    fn bad_prefix_is_protocol_error() {
        let mut buf = BytesMut::from(&b"!garbage\r\n"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf), Err(RespError::Protocol));
    }
}
