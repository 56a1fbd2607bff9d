// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

use super::{BulkLoadResult, TracedBulkLoadError};
use crate::types::VolumeId;

/// Options for a bulk-load job.
#[derive(Debug, Clone)]
pub struct BulkLoadOptions {
    /// Root directory; volume `n` lives under `<path>/data<n>`
    pub path: PathBuf,

    /// Size (in bytes) of a block
    pub block_size: usize,

    /// Rows held by one extent, regardless of column width
    pub rows_per_extent: u64,

    /// Extents stored in one segment file before moving to the next segment
    pub extents_per_segment_file: u32,

    /// Segment files per partition on one volume
    pub segments_per_partition: u16,

    /// Rows allocated for the very first extent of a column on a volume. `None`
    /// disables abbreviated extents.
    pub abbreviated_extent_rows: Option<u64>,

    /// Rows accumulated in the column buffer before they are written out
    pub column_buffer_rows: u64,

    /// Raw bytes per chunk of a compressed segment file
    pub compressed_chunk_size: usize,

    /// Whether to `fsync` segment files when they are closed
    pub sync_on_close: bool,
}

impl BulkLoadOptions {
    pub fn default_for_cli() -> Self {
        Self {
            path: PathBuf::new().join("risinglight.bulkload"),
            block_size: 8 * (1 << 10),        // 8KB
            rows_per_extent: 8 * (1 << 20),   // 8M rows
            extents_per_segment_file: 2,
            segments_per_partition: 4,
            abbreviated_extent_rows: Some(256 * (1 << 10)),
            column_buffer_rows: 64 * (1 << 10),
            compressed_chunk_size: 4 * (1 << 20), // 4MB
            sync_on_close: true,
        }
    }

    pub fn default_for_test(path: PathBuf) -> Self {
        Self {
            path,
            block_size: 64,
            rows_per_extent: 512,
            extents_per_segment_file: 2,
            segments_per_partition: 2,
            abbreviated_extent_rows: None,
            column_buffer_rows: 100,
            compressed_chunk_size: 256,
            sync_on_close: false,
        }
    }

    /// Checks that extents of every column width are a whole number of blocks.
    pub fn validate(&self) -> BulkLoadResult<()> {
        let block_size = self.block_size as u64;
        if block_size == 0 || self.rows_per_extent == 0 {
            return Err(TracedBulkLoadError::logic(
                "block size and rows per extent must be positive",
            ));
        }
        if self.rows_per_extent % block_size != 0 {
            return Err(TracedBulkLoadError::logic(format!(
                "rows per extent {} is not a multiple of block size {}",
                self.rows_per_extent, self.block_size
            )));
        }
        if let Some(rows) = self.abbreviated_extent_rows {
            if rows == 0 || rows >= self.rows_per_extent || rows % block_size != 0 {
                return Err(TracedBulkLoadError::logic(format!(
                    "invalid abbreviated extent size: {rows} rows"
                )));
            }
        }
        if self.extents_per_segment_file == 0 || self.segments_per_partition == 0 {
            return Err(TracedBulkLoadError::logic(
                "segment file layout must be positive",
            ));
        }
        if self.column_buffer_rows == 0 || self.compressed_chunk_size == 0 {
            return Err(TracedBulkLoadError::logic("buffer sizes must be positive"));
        }
        Ok(())
    }

    pub fn blocks_per_extent(&self, width: u32) -> u64 {
        self.extent_bytes(width) / self.block_size as u64
    }

    /// Raw bytes of a full extent.
    pub fn extent_bytes(&self, width: u32) -> u64 {
        self.rows_per_extent * width as u64
    }

    /// Raw bytes of an abbreviated extent, if they are enabled.
    pub fn abbrev_extent_bytes(&self, width: u32) -> Option<u64> {
        self.abbreviated_extent_rows.map(|rows| rows * width as u64)
    }

    pub fn volume_path(&self, volume: VolumeId) -> PathBuf {
        self.path.join(format!("data{volume}"))
    }
}
