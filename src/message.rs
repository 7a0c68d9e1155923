//! The recursive key/value tree (`Message`) carried in VICI command, reply,
//! and event payloads, and its binary codec.
//!
//! A `Message` is an unordered mapping from string keys to one of three
//! value kinds — scalar, list of scalars, or nested section — matching the
//! wire format's three element shapes rather than Rust's native map/vec/enum
//! distinctions. Insertion order is preserved internally for deterministic
//! encoding in tests, but receivers must not depend on it: the daemon
//! treats containers as sets of keys (see [`Message`]'s `PartialEq` impl,
//! which compares as a map, not a sequence).

use crate::error::{Error, Result};
use std::fmt;

/// One byte holds a key's length.
pub const MAX_KEY_LEN: usize = 255;
/// Two bytes (big-endian) hold a scalar's or list item's length.
pub const MAX_VALUE_LEN: usize = 65535;
/// Recursion guard for nested sections; the wire format itself has no limit.
pub const DEFAULT_MAX_DEPTH: usize = 32;

const TAG_SECTION_START: u8 = 0x01;
const TAG_SECTION_END: u8 = 0x02;
const TAG_KEY_VALUE: u8 = 0x03;
const TAG_LIST_START: u8 = 0x04;
const TAG_LIST_ITEM: u8 = 0x05;
const TAG_LIST_END: u8 = 0x06;

/// A value held at one key of a [`Message`].
#[derive(Debug, Clone)]
pub enum Value {
    /// An opaque byte string. The codec never validates these as UTF-8
    /// (callers decide whether a given key's value is meant as text).
    Scalar(Vec<u8>),
    /// An ordered sequence of scalars. Item order is part of the value —
    /// unlike key order, the daemon does rely on it for things like
    /// repeated `proposals` entries.
    List(Vec<Vec<u8>>),
    /// A nested message.
    Section(Message),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Section(a), Value::Section(b)) => a == b,
            _ => false,
        }
    }
}

/// A recursive map from string keys to [`Value`]s.
///
/// Constructed empty via [`Message::new`], populated with `insert_*`, read
/// back with `get_*`. The top-level message handed to [`crate::message::encode`]
/// is encoded without the outer section framing (spec §4.2); nested values
/// inserted via `insert_section` get the `0x01`/`0x02` wrapping.
#[derive(Debug, Clone, Default)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl PartialEq for Message {
    /// Compares containers as maps: key order is irrelevant, but list
    /// element order and section contents are compared structurally.
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k) == Some(v))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Encode(format!(
            "key '{key}' is {} bytes, exceeds the {MAX_KEY_LEN}-byte limit"
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::Encode(format!(
            "value is {} bytes, exceeds the {MAX_VALUE_LEN}-byte limit",
            value.len()
        )));
    }
    Ok(())
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_scalar(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            Value::Scalar(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[Vec<u8>]> {
        match self.get(key)? {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn get_section(&self, key: &str) -> Option<&Message> {
        match self.get(key)? {
            Value::Section(section) => Some(section),
            _ => None,
        }
    }

    /// Inserts or replaces `key`'s value, without validating lengths. Used
    /// internally by the decoder, which already draws lengths from a wire
    /// format that enforces the limits by construction (one-byte key
    /// length, two-byte value length).
    fn set(&mut self, key: String, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Inserts a scalar value. Re-insertion under an existing key replaces
    /// it (spec §3.1).
    pub fn insert_scalar(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        validate_value(&value)?;
        self.set(key, Value::Scalar(value));
        Ok(())
    }

    /// Inserts a list value. Callers needing ordered repetition of a key
    /// use this rather than calling `insert_scalar` twice, since the codec
    /// forbids repeated keys at encode time (spec §4.2).
    pub fn insert_list<I, V>(&mut self, key: impl Into<String>, items: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        let key = key.into();
        validate_key(&key)?;
        let items: Vec<Vec<u8>> = items.into_iter().map(Into::into).collect();
        for item in &items {
            validate_value(item)?;
        }
        self.set(key, Value::List(items));
        Ok(())
    }

    /// Inserts a nested section.
    pub fn insert_section(&mut self, key: impl Into<String>, section: Message) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.set(key, Value::Section(section));
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, _)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}")?;
        }
        write!(f, "}}")
    }
}

/// Encodes `message` into the VICI binary format. The outermost container
/// is emitted unframed (spec §4.2): no leading `0x01`/trailing `0x02`.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    encode_container(message, &mut out);
    out
}

fn encode_container(message: &Message, out: &mut Vec<u8>) {
    for (key, value) in &message.entries {
        match value {
            Value::Scalar(bytes) => {
                out.push(TAG_KEY_VALUE);
                out.push(key.len() as u8);
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Value::List(items) => {
                out.push(TAG_LIST_START);
                out.push(key.len() as u8);
                out.extend_from_slice(key.as_bytes());
                for item in items {
                    out.push(TAG_LIST_ITEM);
                    out.extend_from_slice(&(item.len() as u16).to_be_bytes());
                    out.extend_from_slice(item);
                }
                out.push(TAG_LIST_END);
            }
            Value::Section(inner) => {
                out.push(TAG_SECTION_START);
                out.push(key.len() as u8);
                out.extend_from_slice(key.as_bytes());
                encode_container(inner, out);
                out.push(TAG_SECTION_END);
            }
        }
    }
}

/// Decodes a message from `bytes`, capping section nesting at
/// [`DEFAULT_MAX_DEPTH`].
pub fn decode(bytes: &[u8]) -> Result<Message> {
    decode_with_limit(bytes, DEFAULT_MAX_DEPTH)
}

/// Decodes a message from `bytes`, capping section nesting at `max_depth`.
pub fn decode_with_limit(bytes: &[u8], max_depth: usize) -> Result<Message> {
    let mut reader = Reader::new(bytes);
    let message = decode_container(&mut reader, 0, max_depth, false)?;
    Ok(message)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Protocol("unexpected end of message".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(
                "declared length exceeds remaining buffer".into(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_key(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol("key is not valid UTF-8".into()))
    }
}

fn decode_container(
    reader: &mut Reader,
    depth: usize,
    max_depth: usize,
    nested: bool,
) -> Result<Message> {
    let mut message = Message::new();
    loop {
        if reader.remaining() == 0 {
            if nested {
                return Err(Error::Protocol(
                    "unexpected end of message inside a section".into(),
                ));
            }
            return Ok(message);
        }

        let tag = reader.read_u8()?;
        match tag {
            TAG_SECTION_END if nested => return Ok(message),
            TAG_KEY_VALUE => {
                let key = reader.read_key()?;
                let len = reader.read_u16()? as usize;
                let value = reader.read_bytes(len)?.to_vec();
                message.set(key, Value::Scalar(value));
            }
            TAG_LIST_START => {
                let key = reader.read_key()?;
                let mut items = Vec::new();
                loop {
                    match reader.read_u8()? {
                        TAG_LIST_ITEM => {
                            let len = reader.read_u16()? as usize;
                            items.push(reader.read_bytes(len)?.to_vec());
                        }
                        TAG_LIST_END => break,
                        other => {
                            return Err(Error::Protocol(format!(
                                "unexpected element tag {other:#04x} inside list"
                            )))
                        }
                    }
                }
                message.set(key, Value::List(items));
            }
            TAG_SECTION_START => {
                let key = reader.read_key()?;
                if depth + 1 > max_depth {
                    return Err(Error::Protocol(format!(
                        "section nesting exceeds the {max_depth}-level limit"
                    )));
                }
                let inner = decode_container(reader, depth + 1, max_depth, true)?;
                message.set(key, Value::Section(inner));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected element tag {other:#04x}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_key_value_round_trip() {
        let mut m = Message::new();
        m.insert_scalar("key", b"value".to_vec()).unwrap();
        let bytes = encode(&m);
        assert_eq!(
            bytes,
            vec![0x03, 0x03, b'k', b'e', b'y', 0x00, 0x05, b'v', b'a', b'l', b'u', b'e']
        );
        assert_eq!(decode(&bytes).unwrap(), m);
    }

    #[test]
    fn s2_list_round_trip() {
        let mut m = Message::new();
        m.insert_list("xs", vec![b"a".to_vec(), b"bb".to_vec()])
            .unwrap();
        let bytes = encode(&m);
        let expected = vec![
            0x04, 0x02, b'x', b's', 0x05, 0x00, 0x01, b'a', 0x05, 0x00, 0x02, b'b', b'b', 0x06,
        ];
        assert_eq!(bytes, expected);
        assert_eq!(decode(&bytes).unwrap(), m);
    }

    #[test]
    fn s3_nested_section_round_trip() {
        let mut inner = Message::new();
        inner.insert_scalar("k", b"v".to_vec()).unwrap();
        let mut outer = Message::new();
        outer.insert_section("outer", inner).unwrap();
        let bytes = encode(&outer);
        let expected = vec![
            0x01, 0x05, b'o', b'u', b't', b'e', b'r', 0x03, 0x01, b'k', 0x00, 0x01, b'v', 0x02,
        ];
        assert_eq!(bytes, expected);
        assert_eq!(decode(&bytes).unwrap(), outer);
    }

    #[test]
    fn round_trip_ignores_key_order() {
        let mut a = Message::new();
        a.insert_scalar("one", b"1".to_vec()).unwrap();
        a.insert_scalar("two", b"2".to_vec()).unwrap();

        let mut b = Message::new();
        b.insert_scalar("two", b"2".to_vec()).unwrap();
        b.insert_scalar("one", b"1".to_vec()).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn reinsertion_replaces() {
        let mut m = Message::new();
        m.insert_scalar("k", b"first".to_vec()).unwrap();
        m.insert_scalar("k", b"second".to_vec()).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.get_scalar("k"), Some(&b"second"[..]));
    }

    #[test]
    fn deeply_nested_sections_round_trip() {
        let mut innermost = Message::new();
        innermost.insert_scalar("leaf", b"v".to_vec()).unwrap();

        let mut message = innermost;
        for i in 0..10 {
            let mut wrapper = Message::new();
            wrapper.insert_section(format!("s{i}"), message).unwrap();
            message = wrapper;
        }

        let bytes = encode(&message);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut message = Message::new();
        message.insert_scalar("leaf", b"v".to_vec()).unwrap();
        for i in 0..5 {
            let mut wrapper = Message::new();
            wrapper.insert_section(format!("s{i}"), message).unwrap();
            message = wrapper;
        }
        let bytes = encode(&message);

        assert!(decode_with_limit(&bytes, 3).is_err());
        assert!(decode_with_limit(&bytes, 5).is_ok());
    }

    #[test]
    fn key_too_long_is_rejected() {
        let mut m = Message::new();
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            m.insert_scalar(key, b"v".to_vec()),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn value_too_long_is_rejected() {
        let mut m = Message::new();
        let value = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            m.insert_scalar("k", value),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn truncated_message_is_a_protocol_error() {
        // TAG_KEY_VALUE with a key but no length/value bytes.
        let bytes = vec![0x03, 0x01, b'k'];
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn unterminated_section_is_a_protocol_error() {
        let bytes = vec![0x01, 0x01, b'k'];
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn unexpected_tag_is_a_protocol_error() {
        let bytes = vec![0xff];
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn values_are_opaque_bytes_not_validated_as_utf8() {
        let mut m = Message::new();
        m.insert_scalar("k", vec![0xff, 0xfe, 0x00]).unwrap();
        let bytes = encode(&m);
        assert_eq!(decode(&bytes).unwrap(), m);
    }
}
