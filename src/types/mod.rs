// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Identifiers and column data types understood by the bulk loader.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod value;
pub use self::value::*;

/// Object id of a column (or of a dictionary store) in the system catalog.
pub type Oid = u32;
/// Position of a column inside the table being loaded.
pub type ColumnId = u32;
/// Identifier of a storage volume (a `DBRoot`).
pub type VolumeId = u16;
pub type PartitionId = u32;
pub type SegmentId = u16;
/// Logical block address. Used as the external identity of an extent.
pub type Lbid = i64;
/// High water mark: file-relative offset of the last block written.
pub type Hwm = u64;
/// 0-based input row number, counted from the first row of the import.
pub type RowId = u64;

/// Widest value stored inline in a segment file. Wider character columns are
/// stored in a dictionary and the column file holds 8-byte tokens.
pub const MAX_INLINE_CHAR_WIDTH: u32 = 8;

/// Token written for a `NULL` dictionary value.
pub const NULL_TOKEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;
/// Token used to fill unwritten space in a dictionary token column.
pub const EMPTY_TOKEN: u64 = u64::MAX;

const CHAR_NULL_BYTE: u8 = 0xFE;
const CHAR_EMPTY_BYTE: u8 = 0xFF;

/// Column data type, as declared in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Char(u32),
    Varchar(u32),
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let sized = |prefix: &str| -> Option<Result<u32, String>> {
            let rest = s.strip_prefix(prefix)?;
            let len = rest.trim_start_matches('(').trim_end_matches(')');
            Some(
                len.parse::<u32>()
                    .map_err(|_| format!("invalid length in data type: {s}")),
            )
        };
        match s.as_str() {
            "tinyint" | "int1" | "int8" => Ok(Self::Int8),
            "smallint" | "int2" | "int16" => Ok(Self::Int16),
            "int" | "int4" | "integer" | "int32" => Ok(Self::Int32),
            "bigint" | "int64" => Ok(Self::Int64),
            _ => {
                if let Some(len) = sized("varchar") {
                    Ok(Self::Varchar(len?))
                } else if let Some(len) = sized("char") {
                    Ok(Self::Char(len?))
                } else {
                    Err(format!("unsupported data type: {s}"))
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "TINYINT"),
            Self::Int16 => write!(f, "SMALLINT"),
            Self::Int32 => write!(f, "INTEGER"),
            Self::Int64 => write!(f, "BIGINT"),
            Self::Char(n) => write!(f, "CHAR({n})"),
            Self::Varchar(n) => write!(f, "VARCHAR({n})"),
        }
    }
}

impl DataType {
    /// Width in bytes of one value inside a column segment file.
    pub fn width(&self) -> u32 {
        match self {
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 => 8,
            _ if self.is_dictionary() => 8,
            Self::Char(n) | Self::Varchar(n) => (*n).max(1).next_power_of_two(),
        }
    }

    /// Declared character length, if this is a character type.
    pub fn char_len(&self) -> Option<u32> {
        match self {
            Self::Char(n) | Self::Varchar(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether values live in a dictionary store and the column holds tokens.
    pub fn is_dictionary(&self) -> bool {
        match self {
            Self::Char(n) => *n > MAX_INLINE_CHAR_WIDTH,
            Self::Varchar(n) => *n >= MAX_INLINE_CHAR_WIDTH,
            _ => false,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// Dictionary token columns carry no min/max statistics.
    pub fn supports_cp(&self) -> bool {
        !self.is_dictionary()
    }

    /// Smallest storable integer. The two values below it are the null and
    /// empty markers.
    pub fn min_int(&self) -> i64 {
        match self {
            Self::Int8 => i8::MIN as i64 + 2,
            Self::Int16 => i16::MIN as i64 + 2,
            Self::Int32 => i32::MIN as i64 + 2,
            _ => i64::MIN + 2,
        }
    }

    pub fn max_int(&self) -> i64 {
        match self {
            Self::Int8 => i8::MAX as i64,
            Self::Int16 => i16::MAX as i64,
            Self::Int32 => i32::MAX as i64,
            _ => i64::MAX,
        }
    }

    /// Encoded `NULL` marker, `width()` bytes long.
    pub fn null_value(&self) -> Vec<u8> {
        match self {
            _ if self.is_dictionary() => NULL_TOKEN.to_le_bytes().to_vec(),
            Self::Char(_) | Self::Varchar(_) => vec![CHAR_NULL_BYTE; self.width() as usize],
            _ => int_marker(self.width(), 0),
        }
    }

    /// Encoded marker used to fill allocated but unwritten space.
    pub fn empty_value(&self) -> Vec<u8> {
        match self {
            _ if self.is_dictionary() => EMPTY_TOKEN.to_le_bytes().to_vec(),
            Self::Char(_) | Self::Varchar(_) => vec![CHAR_EMPTY_BYTE; self.width() as usize],
            _ => int_marker(self.width(), 1),
        }
    }
}

/// `MIN + offset` of a signed integer of `width` bytes, little endian.
fn int_marker(width: u32, offset: i64) -> Vec<u8> {
    match width {
        1 => ((i8::MIN as i64 + offset) as i8).to_le_bytes().to_vec(),
        2 => ((i16::MIN as i64 + offset) as i16).to_le_bytes().to_vec(),
        4 => ((i32::MIN as i64 + offset) as i32).to_le_bytes().to_vec(),
        _ => (i64::MIN + offset).to_le_bytes().to_vec(),
    }
}
