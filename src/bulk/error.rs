// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::Oid;

#[derive(Error, Debug)]
pub enum BulkLoadError {
    #[error("failed to {op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no volumes assigned to column {0}")]
    NoVolumes(Oid),
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("logic error: {0}")]
    Logic(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("auto-increment error: {0}")]
    AutoIncrement(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid checksum: found {0}, expected {1}")]
    Checksum(u64, u64),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<serde_json::Error> for TracedBulkLoadError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedBulkLoadError {
        BulkLoadError::Json(e).into()
    }
}

/// [`BulkLoadError`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedBulkLoadError {
    #[from]
    source: BulkLoadError,
    backtrace: Backtrace,
}

impl std::fmt::Debug for TracedBulkLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedBulkLoadError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        BulkLoadError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
        .into()
    }

    pub fn no_volumes(oid: Oid) -> Self {
        BulkLoadError::NoVolumes(oid).into()
    }

    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        BulkLoadError::NotFound(ty, item.to_string()).into()
    }

    pub fn logic(message: impl ToString) -> Self {
        BulkLoadError::Logic(message.to_string()).into()
    }

    pub fn invalid_state(state: impl ToString) -> Self {
        BulkLoadError::InvalidState(state.to_string()).into()
    }

    pub fn auto_increment(message: impl ToString) -> Self {
        BulkLoadError::AutoIncrement(message.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        BulkLoadError::Decode(message.to_string()).into()
    }

    pub fn checksum(found: u64, expected: u64) -> Self {
        BulkLoadError::Checksum(found, expected).into()
    }

    /// The underlying error, without backtrace.
    pub fn kind(&self) -> &BulkLoadError {
        &self.source
    }
}

pub type BulkLoadResult<T> = std::result::Result<T, TracedBulkLoadError>;
