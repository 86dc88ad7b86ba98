//! The `/sam/...` control message codec.
//!
//! A message is a hierarchical text address (always starting with
//! `/sam/`), a null-terminated type-tag string built from `i`/`f`/`s`,
//! and arguments packed in order with 4-byte zero padding between fields
//! (matching the argument layout of the original OSC-derived protocol).
//! Over TCP, a complete message is framed with a `0xC0` delimiter byte
//! before and after it (SLIP-style); any `0xC0` or `0xDB` byte inside the
//! payload is escaped. Over UDP one datagram is one message, unframed.

use crate::error::CodecError;

pub const FRAME_DELIMITER: u8 = 0xC0;
const ESCAPE: u8 = 0xDB;
const ESCAPED_DELIMITER: u8 = 0xDC;
const ESCAPED_ESCAPE: u8 = 0xDD;

/// A single typed argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    String(String),
}

impl OscArg {
    fn type_tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::String(_) => 's',
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            OscArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            OscArg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscArg::String(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// An addressed control message: `/sam/app/register`, `/sam/set/volume`, …
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn with_int(mut self, v: i32) -> Self {
        self.args.push(OscArg::Int(v));
        self
    }

    pub fn with_float(mut self, v: f32) -> Self {
        self.args.push(OscArg::Float(v));
        self
    }

    pub fn with_string(mut self, v: impl Into<String>) -> Self {
        self.args.push(OscArg::String(v.into()));
        self
    }

    pub fn type_tag(&self) -> String {
        self.args.iter().map(|a| a.type_tag()).collect()
    }

    /// Encode address + type tag + arguments. Each null-terminated string
    /// field (address, type tag) and each string argument is padded with
    /// zero bytes up to the next 4-byte boundary; numeric arguments are
    /// always exactly 4 bytes and need no padding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_padded_cstring(&mut out, &self.address);

        let mut tags = String::from(",");
        tags.push_str(&self.type_tag());
        push_padded_cstring(&mut out, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
                OscArg::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
                OscArg::String(s) => push_padded_cstring(&mut out, s),
            }
        }
        out
    }

    /// Decode a single unframed message from `data`.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (address, mut offset) = read_cstring(data, 0)?;
        if !address.starts_with("/sam/") {
            return Err(CodecError::BadAddressPrefix);
        }
        if !address.bytes().all(|b| b.is_ascii_graphic() || b == b'/') {
            return Err(CodecError::NonPrintableAddress);
        }
        offset = pad4(offset);

        if offset >= data.len() {
            // No type tag at all: zero-argument message with no comma.
            return Ok(Self {
                address,
                args: Vec::new(),
            });
        }

        let (tags, mut cursor) = read_cstring(data, offset)?;
        let tags = tags.strip_prefix(',').unwrap_or(&tags).to_string();
        cursor = pad4(cursor);

        let mut args = Vec::with_capacity(tags.len());
        for (index, tag) in tags.chars().enumerate() {
            match tag {
                'i' => {
                    let bytes = take(data, cursor, 4, index, 'i')?;
                    args.push(OscArg::Int(i32::from_be_bytes(bytes.try_into().unwrap())));
                    cursor += 4;
                }
                'f' => {
                    let bytes = take(data, cursor, 4, index, 'f')?;
                    args.push(OscArg::Float(f32::from_be_bytes(bytes.try_into().unwrap())));
                    cursor += 4;
                }
                's' => {
                    let (s, next) = read_cstring(data, cursor)
                        .map_err(|_| CodecError::UnterminatedStringArg)?;
                    args.push(OscArg::String(s));
                    cursor = pad4(next);
                }
                other => return Err(CodecError::UnknownTypeTag(other)),
            }
        }

        Ok(Self { address, args })
    }
}

fn take<'a>(
    data: &'a [u8],
    start: usize,
    len: usize,
    index: usize,
    tag: char,
) -> Result<&'a [u8], CodecError> {
    if start + len > data.len() {
        return Err(CodecError::TruncatedArgument { index, tag });
    }
    Ok(&data[start..start + len])
}

fn pad4(len: usize) -> usize {
    let rem = len % 4;
    if rem == 0 {
        len
    } else {
        len + (4 - rem)
    }
}

fn push_padded_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Read a null-terminated string starting at `start`, returning the
/// string and the offset just past the terminator.
fn read_cstring(data: &[u8], start: usize) -> Result<(String, usize), CodecError> {
    let rel = data[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::UnterminatedAddress)?;
    let s = String::from_utf8_lossy(&data[start..start + rel]).into_owned();
    Ok((s, start + rel + 1))
}

/// SLIP-style TCP framing: escape `0xC0`/`0xDB` inside the payload, then
/// wrap with a delimiter byte on both sides.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(FRAME_DELIMITER);
    for &b in payload {
        match b {
            FRAME_DELIMITER => {
                out.push(ESCAPE);
                out.push(ESCAPED_DELIMITER);
            }
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPED_ESCAPE);
            }
            other => out.push(other),
        }
    }
    out.push(FRAME_DELIMITER);
    out
}

/// Reverse of [`frame`]: given bytes between two delimiters (delimiters
/// not included), undo the escaping.
pub fn unframe(framed_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(framed_payload.len());
    let mut iter = framed_payload.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            match iter.next() {
                Some(ESCAPED_DELIMITER) => out.push(FRAME_DELIMITER),
                Some(ESCAPED_ESCAPE) => out.push(ESCAPE),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Scan `buf` for complete `0xC0 ... 0xC0` frames, returning each
/// unframed payload and the number of bytes consumed from the front of
/// `buf`. Used by the TCP reader to pull whole messages out of a
/// streaming byte buffer.
pub fn split_frames(buf: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut messages = Vec::new();
    let mut consumed = 0;
    let mut rest = buf;

    loop {
        let Some(start) = rest.iter().position(|&b| b == FRAME_DELIMITER) else {
            break;
        };
        let after_start = &rest[start + 1..];
        let Some(end) = after_start.iter().position(|&b| b == FRAME_DELIMITER) else {
            break;
        };
        let payload = &after_start[..end];
        messages.push(unframe(payload));
        let frame_len = start + 1 + end + 1;
        consumed += frame_len;
        rest = &rest[frame_len..];
    }

    (messages, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip_all_types() {
        let msg = OscMessage::new("/sam/app/register")
            .with_string("client")
            .with_int(2)
            .with_float(1.5);
        let encoded = msg.encode();
        let decoded = OscMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn message_roundtrip_no_args() {
        let msg = OscMessage::new("/sam/app/unregister");
        let encoded = msg.encode();
        let decoded = OscMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.address, "/sam/app/unregister");
        assert!(decoded.args.is_empty());
    }

    #[test]
    fn rejects_bad_prefix() {
        let mut msg = OscMessage::new("/other/thing");
        msg.args.push(OscArg::Int(1));
        let encoded = msg.encode();
        assert_eq!(
            OscMessage::decode(&encoded).unwrap_err(),
            CodecError::BadAddressPrefix
        );
    }

    #[test]
    fn rejects_unknown_type_tag() {
        // Hand-craft: address + tag string with an unsupported tag 'd'.
        let mut buf = Vec::new();
        push_padded_cstring(&mut buf, "/sam/set/volume");
        push_padded_cstring(&mut buf, ",d");
        buf.extend_from_slice(&0i32.to_be_bytes());
        assert_eq!(
            OscMessage::decode(&buf).unwrap_err(),
            CodecError::UnknownTypeTag('d')
        );
    }

    #[test]
    fn rejects_truncated_argument() {
        let mut buf = Vec::new();
        push_padded_cstring(&mut buf, "/sam/set/volume");
        push_padded_cstring(&mut buf, ",if");
        buf.extend_from_slice(&1i32.to_be_bytes());
        // missing the float argument entirely
        assert_eq!(
            OscMessage::decode(&buf).unwrap_err(),
            CodecError::TruncatedArgument { index: 1, tag: 'f' }
        );
    }

    #[test]
    fn frame_escapes_delimiter_and_escape_bytes() {
        let payload = vec![0x01, FRAME_DELIMITER, 0x02, ESCAPE, 0x03];
        let framed = frame(&payload);
        assert_eq!(framed[0], FRAME_DELIMITER);
        assert_eq!(*framed.last().unwrap(), FRAME_DELIMITER);
        let inner = &framed[1..framed.len() - 1];
        assert_eq!(unframe(inner), payload);
    }

    #[test]
    fn split_frames_extracts_multiple_messages() {
        let a = OscMessage::new("/sam/app/unregister").with_int(1).encode();
        let b = OscMessage::new("/sam/set/mute").with_int(1).with_int(1).encode();
        let mut stream = Vec::new();
        stream.extend(frame(&a));
        stream.extend(frame(&b));
        stream.push(FRAME_DELIMITER); // start of a third, incomplete frame

        let (messages, consumed) = split_frames(&stream);
        assert_eq!(messages.len(), 2);
        assert_eq!(OscMessage::decode(&messages[0]).unwrap().address, "/sam/app/unregister");
        assert_eq!(OscMessage::decode(&messages[1]).unwrap().address, "/sam/set/mute");
        assert_eq!(consumed, stream.len() - 1);
    }

    #[test]
    fn control_message_is_a_fixed_point_under_encode_decode_encode() {
        let msg = OscMessage::new("/sam/set/position")
            .with_int(3)
            .with_int(10)
            .with_int(20)
            .with_int(100)
            .with_int(100)
            .with_int(0);
        let once = msg.encode();
        let decoded = OscMessage::decode(&once).unwrap();
        let twice = decoded.encode();
        assert_eq!(once, twice);
    }
}
