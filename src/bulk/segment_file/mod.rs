// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Physical segment files of a column.
//!
//! All offsets and sizes seen through [`SegmentFileBackend`] are raw
//! (uncompressed) bytes, no matter how the file is laid out on disk.

use std::path::{Path, PathBuf};

pub use self::compressed::*;
pub use self::raw::*;
use super::{BulkLoadOptions, BulkLoadResult};
use crate::catalog::{CompressionMode, JobColumn};
use crate::types::{Oid, PartitionId, SegmentId, VolumeId};

mod compressed;
mod raw;

/// Storage of one open segment file.
pub trait SegmentFileBackend: Send {
    fn kind(&self) -> &'static str;

    /// Creates a new file holding `raw_bytes` of empty values and opens it.
    fn create(&mut self, path: &Path, raw_bytes: u64) -> BulkLoadResult<()>;

    /// Opens an existing file. The cursor starts at offset 0.
    fn open(&mut self, path: &Path) -> BulkLoadResult<()>;

    fn is_open(&self) -> bool;

    fn path(&self) -> Option<&Path>;

    /// Size of the file in raw bytes.
    fn raw_len(&self) -> u64;

    /// Size of the file on disk.
    fn physical_len(&self) -> BulkLoadResult<u64>;

    /// Current raw offset of the cursor.
    fn position(&self) -> u64;

    fn seek(&mut self, raw_offset: u64) -> BulkLoadResult<()>;

    /// Writes at the cursor and advances it. Writing past `raw_len` is an
    /// error; the file has to be extended first.
    fn write(&mut self, data: &[u8]) -> BulkLoadResult<()>;

    /// Reads `len` raw bytes at `raw_offset`. The cursor does not move.
    fn read_at(&mut self, raw_offset: u64, len: usize) -> BulkLoadResult<Vec<u8>>;

    /// Appends `raw_bytes` of empty values. The cursor does not move.
    fn extend(&mut self, raw_bytes: u64) -> BulkLoadResult<()>;

    fn flush(&mut self) -> BulkLoadResult<()>;

    /// Closes the file. With `flush == false` buffered data is dropped.
    fn close(&mut self, flush: bool) -> BulkLoadResult<()>;
}

pub fn path_of_segment_file(
    options: &BulkLoadOptions,
    oid: Oid,
    volume: VolumeId,
    partition: PartitionId,
    segment: SegmentId,
) -> PathBuf {
    options
        .volume_path(volume)
        .join(oid.to_string())
        .join(partition.to_string())
        .join(format!("FILE{segment:03}.cdf"))
}

/// Creates the backend matching the column's compression mode.
pub fn new_segment_backend(
    column: &JobColumn,
    options: &BulkLoadOptions,
) -> Box<dyn SegmentFileBackend> {
    let empty = column.data_type().empty_value();
    match column.compression() {
        CompressionMode::None => Box::new(RawBackend::new(empty, options.sync_on_close)),
        CompressionMode::Compressed => Box::new(CompressedBackend::new(
            empty,
            options.compressed_chunk_size,
            options.sync_on_close,
        )),
    }
}

/// `len` bytes of the repeated `pattern`.
fn fill_pattern(pattern: &[u8], len: usize) -> Vec<u8> {
    pattern.iter().copied().cycle().take(len).collect()
}
