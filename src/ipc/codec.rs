//! Tagged binary codec for the test-resources value system.
//!
//! Every value is one tag byte followed by a kind-specific payload:
//!
//! | tag | kind    | payload                                         |
//! |-----|---------|-------------------------------------------------|
//! | 0   | null    | none                                            |
//! | 1   | result  | the wrapped value (next encoded value)          |
//! | 2   | boolean | 1 byte, 0 or 1                                  |
//! | 3   | integer | 4 bytes, big-endian i32                         |
//! | 4   | string  | u32 big-endian byte length, UTF-8 bytes         |
//! | 5   | list    | u32 big-endian count, encoded elements          |
//! | 6   | map     | u32 big-endian count, encoded key/value pairs   |
//!
//! Responses are always wrapped in a result marker so that the transport
//! handles primitive and composite payloads identically.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_NULL: u8 = 0;
const TAG_RESULT: u8 = 1;
const TAG_BOOLEAN: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;

/// Maximum nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Codec error type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown type tag {0}")]
    UnknownTag(u8),
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },
    #[error("invalid boolean byte {0}")]
    InvalidBoolean(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("value nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} does not fit a u32 length prefix")]
    TooLong(usize),
}

/// A value of the closed wire type-system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<Value, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

/// Canonical text form. Strings render bare; used to canonicalise
/// resource creation parameters and config lookups.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::String(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(map: BTreeMap<String, V>) -> Self {
        Value::Map(
            map.into_iter()
                .map(|(k, v)| (Value::String(k), v.into()))
                .collect(),
        )
    }
}

// -- Encoding --

/// Encode `value` onto `dst`.
pub fn encode(value: &Value, dst: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Bool(b) => {
            dst.put_u8(TAG_BOOLEAN);
            dst.put_u8(u8::from(*b));
        }
        Value::Int(i) => {
            dst.put_u8(TAG_INTEGER);
            dst.put_i32(*i);
        }
        Value::String(s) => {
            dst.put_u8(TAG_STRING);
            dst.put_u32(length_prefix(s.len())?);
            dst.extend_from_slice(s.as_bytes());
        }
        Value::List(items) => {
            dst.put_u8(TAG_LIST);
            dst.put_u32(length_prefix(items.len())?);
            for item in items {
                encode(item, dst)?;
            }
        }
        Value::Map(map) => {
            dst.put_u8(TAG_MAP);
            dst.put_u32(length_prefix(map.len())?);
            for (k, v) in map {
                encode(k, dst)?;
                encode(v, dst)?;
            }
        }
    }
    Ok(())
}

/// Encode `value` behind a result marker, as every response is sent.
pub fn encode_result(value: &Value, dst: &mut BytesMut) -> Result<(), CodecError> {
    dst.put_u8(TAG_RESULT);
    encode(value, dst)
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes(value: &Value) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a result-wrapped value into a fresh buffer.
pub fn result_to_bytes(value: &Value) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_result(value, &mut buf)?;
    Ok(buf.freeze())
}

fn length_prefix(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLong(len))
}

// -- Decoding --

/// Decode one value from `src`, advancing past it.
///
/// Result markers are transparent: the wrapped value is returned.
pub fn decode<B: Buf>(src: &mut B) -> Result<Value, CodecError> {
    decode_at(src, 0)
}

/// Decode a complete body: exactly one value and nothing after it.
pub fn from_slice(mut bytes: &[u8]) -> Result<Value, CodecError> {
    let value = decode(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(CodecError::TrailingBytes(bytes.len()));
    }
    Ok(value)
}

fn decode_at<B: Buf>(src: &mut B, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    need(src, 1)?;
    match src.get_u8() {
        TAG_NULL => Ok(Value::Null),
        TAG_RESULT => decode_at(src, depth + 1),
        TAG_BOOLEAN => {
            need(src, 1)?;
            match src.get_u8() {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(CodecError::InvalidBoolean(other)),
            }
        }
        TAG_INTEGER => {
            need(src, 4)?;
            Ok(Value::Int(src.get_i32()))
        }
        TAG_STRING => {
            let len = read_len(src)?;
            need(src, len)?;
            let mut raw = vec![0u8; len];
            src.copy_to_slice(&mut raw);
            String::from_utf8(raw)
                .map(Value::String)
                .map_err(|_| CodecError::InvalidUtf8)
        }
        TAG_LIST => {
            let count = read_len(src)?;
            // Every element takes at least one byte; cap the allocation
            // by what is actually available.
            let mut items = Vec::with_capacity(count.min(src.remaining()));
            for _ in 0..count {
                items.push(decode_at(src, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = read_len(src)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = decode_at(src, depth + 1)?;
                let value = decode_at(src, depth + 1)?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn read_len<B: Buf>(src: &mut B) -> Result<usize, CodecError> {
    need(src, 4)?;
    Ok(src.get_u32() as usize)
}

fn need<B: Buf>(src: &B, n: usize) -> Result<(), CodecError> {
    if src.remaining() < n {
        return Err(CodecError::UnexpectedEof {
            needed: n - src.remaining(),
        });
    }
    Ok(())
}
