//! Typed property values
//!
//! A value is written as a 32-bit tag followed by its native big-endian
//! encoding. Lists nest recursively.

use bytes::{Buf, BufMut};
use std::fmt;

use super::codec::{need, CodecError};

/// Maximum list nesting accepted on decode
pub const MAX_LIST_DEPTH: usize = 32;

/// Wire tags for each value kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ValueTag {
    Null = 0,
    Text = 1,
    Int32 = 2,
    Int64 = 3,
    Bool = 4,
    Float64 = 5,
    Float32 = 6,
    List = 100,
}

impl ValueTag {
    /// Every known tag, in wire-code order
    pub const ALL: [ValueTag; 8] = [
        ValueTag::Null,
        ValueTag::Text,
        ValueTag::Int32,
        ValueTag::Int64,
        ValueTag::Bool,
        ValueTag::Float64,
        ValueTag::Float32,
        ValueTag::List,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.code() == code)
    }
}

/// A property value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Float64(f64),
    Float32(f32),
    List(Vec<Value>),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Null => ValueTag::Null,
            Value::Text(_) => ValueTag::Text,
            Value::Int32(_) => ValueTag::Int32,
            Value::Int64(_) => ValueTag::Int64,
            Value::Bool(_) => ValueTag::Bool,
            Value::Float64(_) => ValueTag::Float64,
            Value::Float32(_) => ValueTag::Float32,
            Value::List(_) => ValueTag::List,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Append the tagged encoding of this value
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.tag().code());
        match self {
            Value::Null => {}
            Value::Text(s) => put_str(buf, s),
            Value::Int32(v) => buf.put_i32(*v),
            Value::Int64(v) => buf.put_i64(*v),
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Float64(v) => buf.put_f64(*v),
            Value::Float32(v) => buf.put_f32(*v),
            Value::List(items) => {
                buf.put_i32(items.len() as i32);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    /// Read one tagged value
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Self::decode_nested(buf, 0)
    }

    fn decode_nested(buf: &mut impl Buf, depth: usize) -> Result<Self, CodecError> {
        need(buf, 4)?;
        let code = buf.get_i32();
        let tag = ValueTag::from_code(code).ok_or(CodecError::UnknownValueTag(code))?;

        let value = match tag {
            ValueTag::Null => Value::Null,
            ValueTag::Text => Value::Text(get_str(buf)?),
            ValueTag::Int32 => {
                need(buf, 4)?;
                Value::Int32(buf.get_i32())
            }
            ValueTag::Int64 => {
                need(buf, 8)?;
                Value::Int64(buf.get_i64())
            }
            ValueTag::Bool => {
                need(buf, 1)?;
                Value::Bool(buf.get_u8() != 0)
            }
            ValueTag::Float64 => {
                need(buf, 8)?;
                Value::Float64(buf.get_f64())
            }
            ValueTag::Float32 => {
                need(buf, 4)?;
                Value::Float32(buf.get_f32())
            }
            ValueTag::List => {
                if depth >= MAX_LIST_DEPTH {
                    return Err(CodecError::TooDeep(MAX_LIST_DEPTH));
                }
                let count = get_len(buf)?;
                // Every element needs at least its tag.
                if count > buf.remaining() / 4 {
                    return Err(CodecError::Incomplete);
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Self::decode_nested(buf, depth + 1)?);
                }
                Value::List(items)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}L", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}f", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Write a length-prefixed UTF-8 string
pub fn put_str(buf: &mut impl BufMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Read a string written by [`put_str`]
pub fn get_str(buf: &mut impl Buf) -> Result<String, CodecError> {
    let len = get_len(buf)?;
    need(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

/// Read a non-negative 32-bit length or count
pub fn get_len(buf: &mut impl Buf) -> Result<usize, CodecError> {
    need(buf, 4)?;
    let len = buf.get_i32();
    usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
}
