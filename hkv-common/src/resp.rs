//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode requests and decode server replies incrementally from a
//! growing read buffer, so one connection can carry many pipelined replies.
//!
//! ## Design Principles
//! 1. **Resumable**: `RespDecoder` consumes complete elements as they
//!    arrive and keeps unfinished arrays on an explicit stack, so no byte
//!    is scanned twice and nesting never recurses.
//! 2. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 3. **Fail Fast**: Invalid framing is reported immediately; the caller
//!    treats it as fatal for the connection.
//!
//! ## Frame Layout
//!
//! ```text
//! +OK\r\n               simple status
//! -ERR message\r\n      error
//! :42\r\n               integer
//! $5\r\nhello\r\n       bulk string ($-1 = null)
//! *2\r\n<frame><frame>  array (*-1 = null array)
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::HkvError;

/// Upper bound for a single bulk string, mirroring the server default.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Decoded reply fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Borrows the payload of a status or non-null bulk reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }
}

/// Framing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("invalid integer in frame header")]
    InvalidInteger,
    #[error("bulk string of {0} bytes exceeds limit")]
    BulkTooLarge(usize),
    #[error("missing CRLF terminator")]
    MissingCrlf,
    #[error("array nesting deeper than {0} levels")]
    TooDeep(usize),
}

impl From<ProtocolError> for HkvError {
    fn from(err: ProtocolError) -> Self {
        HkvError::Protocol(err.to_string())
    }
}

/// Encodes a RESP2 array header for `count` arguments.
pub fn encode_array_header(count: usize, out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, count);
    out.put_slice(b"\r\n");
}

/// Encodes a plain command made of raw arguments.
pub fn encode_command(args: &[&[u8]], out: &mut BytesMut) {
    encode_array_header(args.len(), out);
    for arg in args {
        crate::args::write_bulk(out, arg);
    }
}

/// Deepest array nesting accepted in one reply.
pub const MAX_NESTING: usize = 512;

/// Array whose header has been read but not all of its elements.
#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<RespValue>,
}

/// One header line, with its payload when the frame is not an array.
enum Header {
    Value(RespValue),
    Array(usize),
}

/// Resumable reply decoder for one connection.
///
/// Complete elements are consumed from the buffer as soon as they arrive;
/// arrays still waiting for elements stay on `stack`. A reply delivered in
/// many reads is therefore scanned once.
#[derive(Debug, Default)]
pub struct RespDecoder {
    stack: Vec<PartialArray>,
}

impl RespDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no reply is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Decodes the next complete frame from the front of `buffer`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. After an error the
    /// decoder state is undefined and the connection must be dropped.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
        loop {
            let mut value = match parse_header(buffer)? {
                None => return Ok(None),
                Some(Header::Value(value)) => value,
                Some(Header::Array(0)) => RespValue::Array(Some(Vec::new())),
                Some(Header::Array(len)) => {
                    if self.stack.len() >= MAX_NESTING {
                        return Err(ProtocolError::TooDeep(MAX_NESTING));
                    }
                    self.stack.push(PartialArray {
                        remaining: len,
                        items: Vec::with_capacity(len.min(1024)),
                    });
                    continue;
                }
            };

            loop {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(Some(value));
                };
                top.items.push(value);
                top.remaining -= 1;
                if top.remaining > 0 {
                    break;
                }
                let items = std::mem::take(&mut top.items);
                self.stack.pop();
                value = RespValue::Array(Some(items));
            }
        }
    }
}

/// Consumes one header (and bulk payload) from `buffer`, or nothing when it
/// is incomplete.
fn parse_header(buffer: &mut BytesMut) -> Result<Option<Header>, ProtocolError> {
    let Some((line, next)) = read_line(&buffer[..], 0) else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(ProtocolError::UnknownType(b'\r'));
    }

    let header = match line[0] {
        b'+' => Header::Value(RespValue::Simple(line[1..].to_vec())),
        b'-' => Header::Value(RespValue::Error(line[1..].to_vec())),
        b':' => Header::Value(RespValue::Integer(parse_i64(&line[1..])?)),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                Header::Value(RespValue::Bulk(None))
            } else {
                let len = len as usize;
                if len > MAX_BULK_LEN {
                    return Err(ProtocolError::BulkTooLarge(len));
                }
                let end = next + len;
                if buffer.len() < end + 2 {
                    return Ok(None);
                }
                if &buffer[end..end + 2] != b"\r\n" {
                    return Err(ProtocolError::MissingCrlf);
                }
                let data = buffer[next..end].to_vec();
                buffer.advance(end + 2);
                return Ok(Some(Header::Value(RespValue::Bulk(Some(data)))));
            }
        }
        b'*' => match parse_i64(&line[1..])? {
            len if len < 0 => Header::Value(RespValue::Array(None)),
            len => Header::Array(len as usize),
        },
        other => return Err(ProtocolError::UnknownType(other)),
    };
    buffer.advance(next);
    Ok(Some(header))
}

fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let pos = rest.windows(2).position(|window| window == b"\r\n")?;
    Some((&rest[..pos], start + pos + 2))
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

pub(crate) fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<Option<RespValue>, ProtocolError> {
        let mut buf = BytesMut::from(input);
        RespDecoder::new().decode(&mut buf)
    }

    #[test]
    fn encodes_command() {
        let mut buf = BytesMut::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_scalar_frames() {
        assert_eq!(decode_all(b"+OK\r\n").unwrap(), Some(RespValue::Simple(b"OK".to_vec())));
        assert_eq!(decode_all(b"-ERR bad\r\n").unwrap(), Some(RespValue::Error(b"ERR bad".to_vec())));
        assert_eq!(decode_all(b":-42\r\n").unwrap(), Some(RespValue::Integer(-42)));
        assert_eq!(decode_all(b"$-1\r\n").unwrap(), Some(RespValue::Bulk(None)));
        assert_eq!(
            decode_all(b"$5\r\nhello\r\n").unwrap(),
            Some(RespValue::Bulk(Some(b"hello".to_vec())))
        );
    }

    #[test]
    fn parses_nested_arrays() {
        let frame = decode_all(b"*2\r\n*1\r\n:1\r\n$1\r\na\r\n").unwrap();
        assert_eq!(
            frame,
            Some(RespValue::Array(Some(vec![
                RespValue::Array(Some(vec![RespValue::Integer(1)])),
                RespValue::Bulk(Some(b"a".to_vec())),
            ])))
        );
    }

    #[test]
    fn partial_array_resumes_where_it_stopped() {
        let mut decoder = RespDecoder::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        // Header and first element are consumed; the partial bulk is not.
        assert_eq!(&buf[..], b"$3\r\nba");
        assert!(!decoder.is_idle());

        buf.extend_from_slice(b"r\r\n+OK\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(RespValue::Array(Some(vec![
                RespValue::Bulk(Some(b"foo".to_vec())),
                RespValue::Bulk(Some(b"bar".to_vec())),
            ])))
        );
        assert!(decoder.is_idle());
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(RespValue::Simple(b"OK".to_vec())));
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_whole_input() {
        let input: &[u8] = b"*3\r\n:1\r\n*2\r\n$-1\r\n-ERR x\r\n*0\r\n";
        let whole = decode_all(input).unwrap();

        let mut decoder = RespDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for &byte in input {
            buf.extend_from_slice(&[byte]);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded, whole);
        assert!(buf.is_empty());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut input = b"*1\r\n".repeat(100_000);
        input.extend_from_slice(b":1\r\n");
        assert_eq!(decode_all(&input), Err(ProtocolError::TooDeep(MAX_NESTING)));

        let mut input = b"*1\r\n".repeat(MAX_NESTING);
        input.extend_from_slice(b":1\r\n");
        assert!(decode_all(&input).unwrap().is_some());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(decode_all(b"?what\r\n"), Err(ProtocolError::UnknownType(b'?')));
        assert_eq!(decode_all(b":12a\r\n"), Err(ProtocolError::InvalidInteger));
        assert_eq!(decode_all(b"$2\r\nabcd\r\n"), Err(ProtocolError::MissingCrlf));
    }
}
