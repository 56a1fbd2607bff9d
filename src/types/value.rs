// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use super::DataType;

/// A parsed input value, before it is encoded into a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Int(i64),
    String(String),
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl<T: Into<DataValue>> From<Option<T>> for DataValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Outcome of encoding one value with [`encode_fixed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedValue {
    /// Key used for casual partitioning min/max; `None` for nulls.
    pub cp_key: Option<i64>,
    /// The value did not fit the column and was clamped, truncated or nulled.
    pub saturated: bool,
}

/// Encodes `value` into `width()` bytes of a fixed-width (non-dictionary)
/// column.
pub fn encode_fixed(ty: DataType, value: &DataValue, out: &mut impl BufMut) -> EncodedValue {
    debug_assert!(!ty.is_dictionary(), "{ty} is stored through a dictionary");
    if ty.is_integer() {
        let (v, saturated) = match value {
            DataValue::Null => {
                out.put_slice(&ty.null_value());
                return EncodedValue {
                    cp_key: None,
                    saturated: false,
                };
            }
            DataValue::Int(v) => (*v, false),
            DataValue::String(s) => match s.trim().parse::<i64>() {
                Ok(v) => (v, false),
                Err(_) => {
                    out.put_slice(&ty.null_value());
                    return EncodedValue {
                        cp_key: None,
                        saturated: true,
                    };
                }
            },
        };
        let clamped = v.clamp(ty.min_int(), ty.max_int());
        put_int(ty.width(), clamped, out);
        return EncodedValue {
            cp_key: Some(clamped),
            saturated: saturated || clamped != v,
        };
    }

    let width = ty.width() as usize;
    let text = match value {
        DataValue::Null => {
            out.put_slice(&ty.null_value());
            return EncodedValue {
                cp_key: None,
                saturated: false,
            };
        }
        DataValue::Int(v) => v.to_string(),
        DataValue::String(s) => s.clone(),
    };
    let max_len = ty.char_len().unwrap_or(width as u32) as usize;
    let bytes = text.as_bytes();
    let truncated = bytes.len() > max_len;
    let bytes = &bytes[..bytes.len().min(max_len)];
    let mut padded = [0u8; 8];
    padded[..bytes.len()].copy_from_slice(bytes);
    out.put_slice(&padded[..width]);
    EncodedValue {
        cp_key: Some(char_cp_key(&padded)),
        saturated: truncated,
    }
}

/// Maps the first 8 bytes of a character value to an `i64` whose signed order
/// matches the byte-wise order of the string.
pub fn char_cp_key(padded: &[u8; 8]) -> i64 {
    (u64::from_be_bytes(*padded) ^ (1 << 63)) as i64
}

fn put_int(width: u32, v: i64, out: &mut impl BufMut) {
    match width {
        1 => out.put_i8(v as i8),
        2 => out.put_i16_le(v as i16),
        4 => out.put_i32_le(v as i32),
        _ => out.put_i64_le(v),
    }
}
