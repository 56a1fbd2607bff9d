// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Catalog metadata consumed by a bulk-load job. It is supplied by the caller
//! and never changes while the job runs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use self::column::*;

mod column;

/// Physical storage mode of a column's segment files.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMode {
    /// Blocks are written as-is.
    #[default]
    None,
    /// Blocks are grouped into compressed chunks behind a chunk pointer header.
    Compressed,
}

impl FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "none" | "raw" => Ok(Self::None),
            "1" | "compressed" | "rle" => Ok(Self::Compressed),
            _ => Err(format!("unknown compression mode: {s}")),
        }
    }
}
