// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bytes::{BufMut, BytesMut};
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::{ColumnLoadInner, ColumnLoader, InitialExtent, SegmentFileInfo};
use crate::bulk::{
    path_of_dictionary_file, path_of_segment_file, AllocatedExtent, BulkLoadResult,
    ColumnExtentUpdate, DictionaryBlocks, DictionaryFileKey, ExtentState, LoadState,
    SavedExtentState, Section, SectionData, SegmentHwmUpdate, TracedBulkLoadError,
};
use crate::types::{Hwm, Lbid, Oid, PartitionId, SegmentId, VolumeId};

/// Proof that the column lock is held.
///
/// Every operation that touches the segment file goes through this guard, so
/// they cannot be called without the lock. Any failing operation moves the
/// column to [`LoadState::Error`].
pub struct ColumnGuard<'a> {
    loader: &'a ColumnLoader,
    inner: MutexGuard<'a, ColumnLoadInner>,
}

impl<'a> ColumnGuard<'a> {
    pub(super) fn new(loader: &'a ColumnLoader, inner: MutexGuard<'a, ColumnLoadInner>) -> Self {
        Self { loader, inner }
    }

    /// Marks the column failed if `result` is an error.
    pub(super) fn track<T>(&mut self, result: BulkLoadResult<T>) -> BulkLoadResult<T> {
        if let Err(e) = &result {
            if self.inner.state != LoadState::Error {
                warn!(
                    column = self.loader.column.name(),
                    error = %e,
                    "column load failed"
                );
                self.inner.state = LoadState::Error;
            }
        }
        result
    }

    pub(super) fn check_writable(&self) -> BulkLoadResult<()> {
        match self.inner.state {
            LoadState::New | LoadState::Loading => Ok(()),
            state => Err(TracedBulkLoadError::invalid_state(format!(
                "column {} is {state}",
                self.loader.column.name()
            ))),
        }
    }

    pub(super) fn buffer_mut(&mut self) -> &mut super::ColumnBufferManager {
        &mut self.inner.buffer
    }

    pub fn state(&self) -> LoadState {
        self.inner.state
    }

    /// Raw bytes left in the current extent.
    pub fn available_raw_bytes(&self) -> u64 {
        self.inner.available_raw_bytes
    }

    /// Raw size of the current segment file.
    pub fn total_raw_file_bytes(&self) -> u64 {
        self.inner.total_raw_file_bytes
    }

    /// Raw bytes of the current segment file before the write cursor.
    pub fn size_written(&self) -> u64 {
        self.inner.size_written
    }

    pub fn is_abbrev_extent(&self) -> bool {
        self.inner.is_abbrev_extent
    }

    fn block_size(&self) -> u64 {
        self.loader.options.block_size as u64
    }

    fn oid(&self) -> Oid {
        self.loader.column.oid()
    }

    /// Accounts for `n` raw bytes just written at the cursor.
    pub fn update_bytes_written_counts(&mut self, n: u64) -> BulkLoadResult<()> {
        if n > self.inner.available_raw_bytes {
            return Err(TracedBulkLoadError::logic(format!(
                "wrote {n} bytes with only {} available",
                self.inner.available_raw_bytes
            )));
        }
        self.inner.size_written += n;
        self.inner.available_raw_bytes -= n;
        Ok(())
    }

    /// Moves the column to the segment file receiving the next extent's worth
    /// of rows, allocating a new extent if needed. With `save_lbid_for_cp` the
    /// LBID of that extent is attached to the next CP entry.
    pub fn extend_column(&mut self, save_lbid_for_cp: bool) -> BulkLoadResult<()> {
        let result = self.extend_column_inner(save_lbid_for_cp);
        self.track(result)
    }

    fn extend_column_inner(&mut self, save_lbid_for_cp: bool) -> BulkLoadResult<()> {
        self.close_column_file(true, false)?;
        self.close_dctnry_store(false)?;
        let next = self.loader.tracker.next_seg_file()?;
        let (lbid, is_new_extent) = if next.new_extent {
            let extent = self.loader.extent_map.create_column_extent(
                self.oid(),
                self.loader.column.width(),
                next.volume,
            )?;
            self.start_new_extent(&extent, next.state == ExtentState::EmptyVolume)?;
            (extent.start_lbid, true)
        } else {
            let lbid =
                self.resume_extent(next.volume, next.partition, next.segment, next.local_hwm + 1)?;
            (lbid, false)
        };
        self.inner.current_lbid = Some(lbid);
        if save_lbid_for_cp {
            self.loader.cp.set_current_entry_lbid(lbid, is_new_extent);
        }
        Ok(())
    }

    /// Opens or creates the file of a freshly allocated extent and positions
    /// the cursor at its first block.
    fn start_new_extent(&mut self, extent: &AllocatedExtent, allow_abbrev: bool) -> BulkLoadResult<()> {
        let options = &self.loader.options;
        let width = self.loader.column.width();
        let block_size = self.block_size();
        let path = path_of_segment_file(
            options,
            self.oid(),
            extent.volume,
            extent.partition,
            extent.segment,
        );
        let start = extent.start_block * block_size;
        let end = (extent.start_block + extent.blocks) * block_size;
        let new_file = extent.start_block == 0;

        let inner = &mut *self.inner;
        if new_file {
            let abbrev = if allow_abbrev {
                options.abbrev_extent_bytes(width).filter(|bytes| *bytes < end)
            } else {
                None
            };
            inner.backend.create(&path, abbrev.unwrap_or(end))?;
            inner.is_abbrev_extent = abbrev.is_some();
        } else {
            inner.backend.open(&path)?;
            let raw_len = inner.backend.raw_len();
            if raw_len < end {
                inner.backend.extend(end - raw_len)?;
            }
            inner.backend.seek(start)?;
            inner.is_abbrev_extent = false;
        }
        inner.volume = extent.volume;
        inner.partition = extent.partition;
        inner.segment = extent.segment;
        inner.current_lbid = Some(extent.start_lbid);
        inner.total_raw_file_bytes = inner.backend.raw_len();
        inner.size_written = start;
        inner.available_raw_bytes = inner.total_raw_file_bytes - start;
        inner.extents_added += 1;
        inner.state = LoadState::Loading;
        self.loader.tracker.record_allocated(extent);
        self.open_dctnry_store(extent.volume, extent.partition, extent.segment, new_file)?;
        info!(
            column = self.loader.column.name(),
            volume = extent.volume,
            partition = extent.partition,
            segment = extent.segment,
            start_lbid = extent.start_lbid,
            abbreviated = self.inner.is_abbrev_extent,
            "started new extent"
        );
        Ok(())
    }

    /// Opens an existing segment file and positions the cursor at block
    /// `hwm`, inside an extent that already has room. Returns the starting
    /// LBID of that extent.
    fn resume_extent(
        &mut self,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        hwm: Hwm,
    ) -> BulkLoadResult<Lbid> {
        let lbid = self
            .loader
            .extent_map
            .extent_start_lbid(self.oid(), volume, partition, segment, hwm)?;
        let block_size = self.block_size();
        let blocks_per_extent = self.loader.tracker.blocks_per_extent();
        let path = path_of_segment_file(&self.loader.options, self.oid(), volume, partition, segment);
        let start = hwm * block_size;
        let extent_end = (hwm - hwm % blocks_per_extent + blocks_per_extent) * block_size;

        let inner = &mut *self.inner;
        inner.backend.open(&path)?;
        let raw_len = inner.backend.raw_len();
        inner.is_abbrev_extent = raw_len < extent_end;
        if inner.is_abbrev_extent && start >= raw_len {
            inner.backend.extend(extent_end - raw_len)?;
            inner.is_abbrev_extent = false;
            debug!(volume, partition, segment, "expanded abbreviated extent on open");
        }
        inner.backend.seek(start)?;
        inner.volume = volume;
        inner.partition = partition;
        inner.segment = segment;
        inner.total_raw_file_bytes = inner.backend.raw_len();
        inner.size_written = start;
        inner.available_raw_bytes = inner.total_raw_file_bytes - start;
        inner.state = LoadState::Loading;
        self.open_dctnry_store(volume, partition, segment, false)?;
        debug!(
            column = self.loader.column.name(),
            volume, partition, segment, hwm, start_lbid = lbid, "resumed extent"
        );
        Ok(lbid)
    }

    pub(super) fn setup_initial_extent(&mut self, initial: &InitialExtent) -> BulkLoadResult<()> {
        let rows_per_extent = self.loader.options.rows_per_extent;
        if initial.skipped_to_new_extent {
            // the starting extent is full or out of step with the other columns,
            // so the next one goes on the same volume
            let extent = self.loader.extent_map.create_column_extent(
                self.oid(),
                self.loader.column.width(),
                initial.volume,
            )?;
            self.start_new_extent(&extent, false)?;
            self.inner.saved = None;
            self.loader
                .cp
                .add_first_entry(rows_per_extent - 1, Some(extent.start_lbid), true);
            self.loader.set_last_input_row_in_extent(rows_per_extent - 1);
        } else {
            let lbid =
                self.resume_extent(initial.volume, initial.partition, initial.segment, initial.hwm)?;
            if lbid != initial.lbid {
                warn!(
                    table = %initial.table_name,
                    column = self.loader.column.name(),
                    expected = initial.lbid,
                    start_lbid = lbid,
                    "starting extent moved since the placement snapshot"
                );
            }
            self.inner.current_lbid = Some(lbid);
            self.inner.saved = Some(SavedExtentState {
                start_lbid: initial.lbid,
                saved_hwm: initial.old_hwm,
            });
            let blocks_per_extent = self.loader.tracker.blocks_per_extent();
            let width = self.loader.column.width() as u64;
            let rows_used = (initial.hwm % blocks_per_extent) * self.block_size() / width;
            let last_row = rows_per_extent - rows_used - 1;
            self.loader
                .cp
                .add_first_entry(last_row, Some(lbid), initial.is_new_extent);
            self.loader.set_last_input_row_in_extent(last_row);
        }
        self.loader.plan_resumed_extents();
        info!(
            table = %initial.table_name,
            column = self.loader.column.name(),
            volume = self.inner.volume,
            partition = self.inner.partition,
            segment = self.inner.segment,
            hwm = self.inner.size_written / self.block_size(),
            last_input_row = self.loader.last_input_row_in_extent(),
            "set up initial column extent"
        );
        Ok(())
    }

    pub(super) fn create_delayed_file(
        &mut self,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        hwm: Hwm,
        table_name: &str,
    ) -> BulkLoadResult<()> {
        let extent = self.loader.extent_map.create_column_extent(
            self.oid(),
            self.loader.column.width(),
            volume,
        )?;
        if (extent.partition, extent.segment) != (partition, segment) {
            warn!(
                table = table_name,
                column = self.loader.column.name(),
                expected_partition = partition,
                expected_segment = segment,
                partition = extent.partition,
                segment = extent.segment,
                "delayed extent landed in another segment file"
            );
        }
        self.start_new_extent(&extent, true)?;
        if hwm > extent.start_block && hwm < extent.start_block + extent.blocks {
            let offset = hwm * self.block_size();
            let skipped = offset - self.inner.size_written;
            self.inner.backend.seek(offset)?;
            self.inner.available_raw_bytes -= skipped;
            self.inner.size_written = offset;
        }
        self.loader.cp.set_current_entry_lbid(extent.start_lbid, true);
        info!(
            table = table_name,
            column = self.loader.column.name(),
            volume,
            start_lbid = extent.start_lbid,
            "created delayed segment file"
        );
        Ok(())
    }

    /// Grows an abbreviated extent to full size. With `retain_file_pos` the
    /// cursor stays where it was; otherwise it is moved to just after the
    /// last row written.
    pub fn expand_abbrev_extent(&mut self, retain_file_pos: bool) -> BulkLoadResult<()> {
        let result = self.expand_abbrev_extent_inner(retain_file_pos);
        self.track(result)
    }

    fn expand_abbrev_extent_inner(&mut self, retain_file_pos: bool) -> BulkLoadResult<()> {
        if !self.inner.is_abbrev_extent {
            return Ok(());
        }
        let full = self.loader.options.extent_bytes(self.loader.column.width());
        let inner = &mut *self.inner;
        let raw_len = inner.backend.raw_len();
        if raw_len < full {
            inner.backend.extend(full - raw_len)?;
        }
        inner.is_abbrev_extent = false;
        inner.total_raw_file_bytes = inner.backend.raw_len();
        inner.available_raw_bytes = inner.total_raw_file_bytes - inner.size_written;
        if !retain_file_pos {
            let end = inner.size_written;
            inner.backend.seek(end)?;
        }
        info!(
            column = self.loader.column.name(),
            volume = inner.volume,
            partition = inner.partition,
            segment = inner.segment,
            raw_bytes = inner.total_raw_file_bytes,
            "expanded abbreviated extent"
        );
        Ok(())
    }

    /// Makes sure there is room for at least one more row.
    fn ensure_space(&mut self) -> BulkLoadResult<()> {
        if self.inner.available_raw_bytes > 0 {
            return Ok(());
        }
        if self.inner.is_abbrev_extent {
            self.expand_abbrev_extent_inner(true)
        } else {
            self.extend_column_inner(true)
        }
    }

    /// Writes fixed-width rows at the cursor, moving on to new extents as
    /// they fill up.
    pub fn write_to_file(&mut self, data: &[u8]) -> BulkLoadResult<()> {
        let result = self.write_fixed(data);
        self.track(result)
    }

    fn write_fixed(&mut self, mut data: &[u8]) -> BulkLoadResult<()> {
        while !data.is_empty() {
            self.ensure_space()?;
            let n = (self.inner.available_raw_bytes as usize).min(data.len());
            self.inner.backend.write(&data[..n])?;
            self.update_bytes_written_counts(n as u64)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Stores dictionary values and writes their tokens. Values are stored in
    /// the dictionary paired with the segment file their tokens land in.
    pub fn write_tokens(&mut self, values: &[Option<Vec<u8>>]) -> BulkLoadResult<()> {
        let result = self.write_tokens_inner(values);
        self.track(result)
    }

    fn write_tokens_inner(&mut self, mut values: &[Option<Vec<u8>>]) -> BulkLoadResult<()> {
        let width = self.loader.column.width() as u64;
        while !values.is_empty() {
            self.ensure_space()?;
            let n = ((self.inner.available_raw_bytes / width) as usize).min(values.len());
            if n == 0 {
                return Err(TracedBulkLoadError::logic("extent is not token aligned"));
            }
            let refs: Vec<Option<&[u8]>> = values[..n].iter().map(|v| v.as_deref()).collect();
            let tokens = self.loader.update_dctnry_store(&refs)?;
            let mut buf = BytesMut::with_capacity(n * width as usize);
            for token in tokens {
                buf.put_u64_le(token);
            }
            self.inner.backend.write(&buf)?;
            self.update_bytes_written_counts(buf.len() as u64)?;
            values = &values[n..];
        }
        Ok(())
    }

    fn write_section(&mut self, section: Section) -> BulkLoadResult<()> {
        if self.inner.state != LoadState::Loading {
            return Err(TracedBulkLoadError::invalid_state(format!(
                "column {} is {} and has no open segment file",
                self.loader.column.name(),
                self.inner.state
            )));
        }
        match section.data() {
            SectionData::Fixed(buf) => self.write_fixed(buf)?,
            SectionData::Strings(values) => self.write_tokens_inner(values)?,
        }
        self.inner.rows_written += section.row_count();
        Ok(())
    }

    /// Writes released sections in row order. Without `force`, waits until
    /// enough rows are buffered.
    pub fn flush(&mut self, force: bool) -> BulkLoadResult<()> {
        let sections = self.inner.buffer.take_ready(force);
        let mut result = Ok(());
        for section in sections {
            result = self.write_section(section);
            if result.is_err() {
                break;
            }
        }
        self.track(result)
    }

    /// Records the HWM of a segment or dictionary file. Keeps the larger one
    /// if the file was recorded before.
    fn record_hwm(&mut self, update: SegmentHwmUpdate) {
        let updates = &mut self.inner.seg_file_updates;
        match updates.iter_mut().find(|u| {
            (u.oid, u.volume, u.partition, u.segment)
                == (update.oid, update.volume, update.partition, update.segment)
        }) {
            Some(existing) => existing.hwm = existing.hwm.max(update.hwm),
            None => updates.push(update),
        }
    }

    /// Closes the current segment file and records its HWM. With `abort`
    /// nothing is flushed or recorded.
    pub fn close_column_file(&mut self, completing_extent: bool, abort: bool) -> BulkLoadResult<()> {
        if !self.inner.backend.is_open() {
            return Ok(());
        }
        if abort {
            let result = self.inner.backend.close(false);
            warn!(column = self.loader.column.name(), "aborted segment file");
            return result;
        }
        self.inner.backend.close(true)?;
        if self.inner.size_written > 0 {
            let hwm = (self.inner.size_written - 1) / self.block_size();
            let update = SegmentHwmUpdate {
                oid: self.oid(),
                volume: self.inner.volume,
                partition: self.inner.partition,
                segment: self.inner.segment,
                hwm,
            };
            self.record_hwm(update);
        }
        debug!(
            column = self.loader.column.name(),
            volume = self.inner.volume,
            partition = self.inner.partition,
            segment = self.inner.segment,
            completing_extent,
            "closed segment file"
        );
        Ok(())
    }

    fn open_dctnry_store(
        &mut self,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        new_file: bool,
    ) -> BulkLoadResult<()> {
        let (Some(dictionary), Some(oid)) = (
            self.loader.dictionary.as_ref(),
            self.loader.column.dictionary_oid(),
        ) else {
            return Ok(());
        };
        let key = DictionaryFileKey {
            oid,
            volume,
            partition,
            segment,
        };
        let mut store = dictionary.lock();
        if !new_file && path_of_dictionary_file(&self.loader.options, &key).exists() {
            store.open(key)
        } else {
            store.create(key)
        }
    }

    /// Closes the dictionary store paired with the current segment file and
    /// records its HWM.
    pub fn close_dctnry_store(&mut self, abort: bool) -> BulkLoadResult<()> {
        let Some(dictionary) = self.loader.dictionary.as_ref() else {
            return Ok(());
        };
        let mut store = dictionary.lock();
        let Some(key) = store.key() else {
            return Ok(());
        };
        if abort {
            return store.truncate();
        }
        let hwm = store.hwm();
        let written = store.written_blocks();
        store.close(true)?;
        drop(store);
        if let Some(blocks) = written {
            self.inner.dict_flush_blocks.push(blocks);
        }
        self.record_hwm(SegmentHwmUpdate {
            oid: key.oid,
            volume: key.volume,
            partition: key.partition,
            segment: key.segment,
            hwm,
        });
        Ok(())
    }

    /// Drops whatever this job appended to the open dictionary store and
    /// closes it. Nothing is recorded for the store.
    pub fn truncate_dctnry_store(&mut self) -> BulkLoadResult<()> {
        let result = match self.loader.dictionary.as_ref() {
            Some(dictionary) => dictionary.lock().truncate(),
            None => Ok(()),
        };
        self.track(result)
    }

    /// Dictionary blocks written by the job so far, one entry per store file
    /// closed.
    pub fn dict_flush_blocks(&self) -> &[DictionaryBlocks] {
        &self.inner.dict_flush_blocks
    }

    /// Whether the current segment file holds all of its extents and is
    /// full.
    pub fn is_file_complete(&self) -> bool {
        let options = &self.loader.options;
        let file_bytes =
            options.extent_bytes(self.loader.column.width()) * options.extents_per_segment_file as u64;
        !self.inner.is_abbrev_extent
            && self.inner.total_raw_file_bytes >= file_bytes
            && self.inner.available_raw_bytes == 0
    }

    /// Size of the current segment file on disk.
    pub fn file_size(&self) -> BulkLoadResult<u64> {
        if !self.inner.backend.is_open() {
            return Err(TracedBulkLoadError::invalid_state(format!(
                "column {} has no open segment file",
                self.loader.column.name()
            )));
        }
        self.inner.backend.physical_len()
    }

    pub(super) fn finish(&mut self) -> BulkLoadResult<()> {
        match self.inner.state {
            LoadState::Error | LoadState::Closed => {
                return Err(TracedBulkLoadError::invalid_state(format!(
                    "column {} is {}",
                    self.loader.column.name(),
                    self.inner.state
                )))
            }
            LoadState::New => {
                self.inner.state = LoadState::Closed;
                return Ok(());
            }
            LoadState::Loading => {}
        }
        if self.inner.buffer.has_outstanding() {
            return Err(TracedBulkLoadError::logic(format!(
                "column {} still has reserved sections",
                self.loader.column.name()
            )));
        }
        self.flush(true)?;
        self.close_column_file(false, false)?;
        self.close_dctnry_store(false)?;
        self.inner.state = LoadState::Closed;
        debug!(
            column = self.loader.column.name(),
            rows = self.inner.rows_written,
            extents_added = self.inner.extents_added,
            "finished column"
        );
        Ok(())
    }

    pub(super) fn abort(&mut self) -> BulkLoadResult<()> {
        self.inner.buffer.clear();
        self.inner.state = LoadState::Error;
        self.close_column_file(false, true)?;
        self.close_dctnry_store(true)
    }

    fn current_hwm(&self) -> Hwm {
        self.inner.size_written.saturating_sub(1) / self.block_size()
    }

    pub(super) fn seg_file_info(&self) -> SegmentFileInfo {
        SegmentFileInfo {
            column_id: self.loader.id,
            volume: self.inner.volume,
            partition: self.inner.partition,
            segment: self.inner.segment,
            hwm: self.current_hwm(),
            path: self.inner.backend.path().map(|p| p.to_path_buf()),
        }
    }

    pub(super) fn extent_update(&self) -> ColumnExtentUpdate {
        let oid = self.oid();
        let final_hwm = self
            .inner
            .seg_file_updates
            .iter()
            .find(|u| {
                (u.oid, u.volume, u.partition, u.segment)
                    == (oid, self.inner.volume, self.inner.partition, self.inner.segment)
            })
            .map_or_else(|| self.current_hwm(), |u| u.hwm);
        let invalidate = self.inner.saved.filter(|_| self.inner.rows_written > 0);
        ColumnExtentUpdate {
            column_id: self.loader.id,
            oid,
            volume: self.inner.volume,
            partition: self.inner.partition,
            segment: self.inner.segment,
            final_hwm,
            hwm_updates: self.inner.seg_file_updates.clone(),
            cp_updates: self.loader.cp.updates(),
            invalidate,
        }
    }
}
