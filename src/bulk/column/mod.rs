// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Load state of one column.
//!
//! A [`ColumnLoader`] is shared by the thread parsing rows and the thread
//! writing them. Everything that touches the current segment file lives behind
//! one mutex. Operations that take that mutex themselves are methods of
//! [`ColumnLoader`]; operations that expect it to be held already are methods
//! of the [`ColumnGuard`] returned by [`ColumnLoader::lock`].
//!
//! Locks are always taken in this order:
//! delayed file creation, column, dictionary. CP statistics, the extent
//! tracker and the planned extent sizes have their own locks, taken last.
//! Auto-increment has its own lock and never nests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

pub use self::buffer::*;
pub use self::guard::*;
use super::{
    new_segment_backend, AutoIncrement, BulkLoadOptions, BulkLoadResult, CpEntry, CpTracker,
    DictionaryBlocks, DictionaryStore, ExtentMap, ExtentMapReport, FileDictionaryStore,
    LoadState, SavedExtentState, SegmentFileBackend, SegmentHwmUpdate, TracedBulkLoadError,
    VolumeExtentTracker,
};
use crate::catalog::JobColumn;
use crate::types::{ColumnId, Hwm, Lbid, PartitionId, RowId, SegmentId, VolumeId};

mod buffer;
mod guard;

/// Where a column starts loading when its first extent already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialExtent {
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub table_name: String,
    /// Starting LBID of the extent holding `old_hwm`.
    pub lbid: Lbid,
    /// HWM stored in the extent map.
    pub old_hwm: Hwm,
    /// First block to write, after skipping the partially written block at
    /// `old_hwm`.
    pub hwm: Hwm,
    /// Start in a new extent on the same volume instead. Set when skipping
    /// blocks moved past the end of the extent, or when the columns of the
    /// table would resume at different rows.
    pub skipped_to_new_extent: bool,
    /// Treat the starting extent's min/max as new instead of merging it.
    pub is_new_extent: bool,
}

/// Current segment file of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFileInfo {
    pub column_id: ColumnId,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub hwm: Hwm,
    pub path: Option<PathBuf>,
}

/// First extent whose allocation waits for the first row.
#[derive(Debug, Clone, Copy)]
struct DelayedFile {
    volume: VolumeId,
    partition: PartitionId,
    segment: SegmentId,
    hwm: Hwm,
}

struct ColumnLoadInner {
    state: LoadState,
    backend: Box<dyn SegmentFileBackend>,
    volume: VolumeId,
    partition: PartitionId,
    segment: SegmentId,
    current_lbid: Option<Lbid>,
    /// Raw bytes of the current file before the write cursor.
    size_written: u64,
    available_raw_bytes: u64,
    total_raw_file_bytes: u64,
    is_abbrev_extent: bool,
    /// Extent holding the HWM at job start, if the job appends to it.
    saved: Option<SavedExtentState>,
    rows_written: u64,
    extents_added: u64,
    seg_file_updates: Vec<SegmentHwmUpdate>,
    dict_flush_blocks: Vec<DictionaryBlocks>,
    buffer: ColumnBufferManager,
}

pub struct ColumnLoader {
    id: ColumnId,
    column: JobColumn,
    table_name: String,
    options: Arc<BulkLoadOptions>,
    tracker: Arc<VolumeExtentTracker>,
    extent_map: Arc<dyn ExtentMap>,
    inner: Mutex<ColumnLoadInner>,
    cp: CpTracker,
    dictionary: Option<Mutex<Box<dyn DictionaryStore>>>,
    auto_inc: Mutex<Option<AutoIncrement>>,
    delayed_file: Mutex<Option<DelayedFile>>,
    last_input_row_in_extent: AtomicU64,
    /// Rows of the partial extents rotation will resume, in order.
    resumed_extent_rows: Mutex<VecDeque<u64>>,
    saturated_rows: AtomicU64,
    width_factor: AtomicU32,
}

impl ColumnLoader {
    pub fn new(
        id: ColumnId,
        column: JobColumn,
        table_name: impl Into<String>,
        tracker: Arc<VolumeExtentTracker>,
        extent_map: Arc<dyn ExtentMap>,
        options: Arc<BulkLoadOptions>,
    ) -> BulkLoadResult<Self> {
        let data_type = column.data_type();
        let dictionary = match (data_type.is_dictionary(), column.dictionary_oid()) {
            (false, _) => None,
            (true, Some(_)) => {
                let store: Box<dyn DictionaryStore> =
                    Box::new(FileDictionaryStore::new(options.as_ref().clone()));
                Some(Mutex::new(store))
            }
            (true, None) => {
                return Err(TracedBulkLoadError::logic(format!(
                    "column {} of type {data_type} has no dictionary",
                    column.name()
                )))
            }
        };
        let auto_inc = if column.is_auto_increment() {
            if !data_type.is_integer() {
                return Err(TracedBulkLoadError::auto_increment(format!(
                    "column {} of type {data_type} cannot be auto-increment",
                    column.name()
                )));
            }
            Some(AutoIncrement::new(column.name(), data_type.max_int() as u64))
        } else {
            None
        };
        let inner = ColumnLoadInner {
            state: LoadState::New,
            backend: new_segment_backend(&column, &options),
            volume: 0,
            partition: 0,
            segment: 0,
            current_lbid: None,
            size_written: 0,
            available_raw_bytes: 0,
            total_raw_file_bytes: 0,
            is_abbrev_extent: false,
            saved: None,
            rows_written: 0,
            extents_added: 0,
            seg_file_updates: vec![],
            dict_flush_blocks: vec![],
            buffer: ColumnBufferManager::new(
                column.width(),
                data_type.is_dictionary(),
                options.column_buffer_rows,
            ),
        };
        Ok(Self {
            id,
            column,
            table_name: table_name.into(),
            options,
            tracker,
            extent_map,
            inner: Mutex::new(inner),
            cp: CpTracker::new(),
            dictionary,
            auto_inc: Mutex::new(auto_inc),
            delayed_file: Mutex::new(None),
            last_input_row_in_extent: AtomicU64::new(0),
            resumed_extent_rows: Mutex::new(VecDeque::new()),
            saturated_rows: AtomicU64::new(0),
            width_factor: AtomicU32::new(1),
        })
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn column(&self) -> &JobColumn {
        &self.column
    }

    pub fn tracker(&self) -> &Arc<VolumeExtentTracker> {
        &self.tracker
    }

    pub fn state(&self) -> LoadState {
        self.inner.lock().state
    }

    /// Takes the column lock.
    pub fn lock(&self) -> ColumnGuard<'_> {
        ColumnGuard::new(self, self.inner.lock())
    }

    /// Opens the segment file the job starts in and positions it after the
    /// skipped blocks.
    pub fn setup_initial_column_extent(&self, initial: InitialExtent) -> BulkLoadResult<()> {
        let mut guard = self.lock();
        let result = guard.setup_initial_extent(&initial);
        guard.track(result)
    }

    /// Defers allocating the first extent until the first row is written.
    pub fn setup_delayed_file_creation(
        &self,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        hwm: Hwm,
    ) {
        let mut delayed = self.delayed_file.lock();
        *delayed = Some(DelayedFile {
            volume,
            partition,
            segment,
            hwm,
        });
        {
            let mut inner = self.inner.lock();
            inner.volume = volume;
            inner.partition = partition;
            inner.segment = segment;
        }
        let last_row = self.options.rows_per_extent - 1;
        self.cp.add_first_entry(last_row, None, true);
        self.last_input_row_in_extent
            .store(last_row, Ordering::Release);
        self.plan_resumed_extents();
        debug!(
            table = %self.table_name,
            column = self.column.name(),
            volume,
            partition,
            segment,
            "delayed file creation"
        );
    }

    /// Allocates the delayed first extent and creates its file. Returns
    /// whether anything was created.
    pub fn create_delayed_file_if_needed(&self, table_name: &str) -> BulkLoadResult<bool> {
        let mut delayed = self.delayed_file.lock();
        let Some(file) = *delayed else {
            return Ok(false);
        };
        let mut guard = self.lock();
        let result = guard.create_delayed_file(
            file.volume,
            file.partition,
            file.segment,
            file.hwm,
            table_name,
        );
        guard.track(result)?;
        *delayed = None;
        Ok(true)
    }

    /// Reserves the next `row_count` rows in the column buffer.
    pub fn reserve_section(&self, row_count: u64) -> BulkLoadResult<Section> {
        let mut guard = self.lock();
        guard.check_writable()?;
        Ok(guard.buffer_mut().reserve(row_count))
    }

    /// Hands back a filled section and writes whatever is ready.
    pub fn release_section(&self, section: Section) -> BulkLoadResult<()> {
        self.create_delayed_file_if_needed(&self.table_name)?;
        let mut guard = self.lock();
        let result = guard.buffer_mut().release(section);
        guard.track(result)?;
        guard.flush(false)
    }

    /// Writes all released sections that are ready, regardless of how many
    /// rows are buffered.
    pub fn intermediate_flush(&self) -> BulkLoadResult<()> {
        self.create_delayed_file_if_needed(&self.table_name)?;
        let mut guard = self.lock();
        guard.flush(true)
    }

    pub fn expand_abbrev_extent(&self, retain_file_pos: bool) -> BulkLoadResult<()> {
        self.lock().expand_abbrev_extent(retain_file_pos)
    }

    pub fn is_abbrev_extent(&self) -> bool {
        self.lock().is_abbrev_extent()
    }

    /// Merges a min/max range into the extent whose last row is
    /// `last_input_row`.
    pub fn update_cp_info(&self, last_input_row: RowId, min: i64, max: i64) {
        self.cp.add_or_update_entry(last_input_row, Some((min, max)));
    }

    /// Updates min/max for parsed rows starting at `first_row`, splitting them
    /// at extent boundaries. `None` keys are nulls. Must be called in row
    /// order.
    pub fn update_cp_for_rows(&self, first_row: RowId, keys: &[Option<i64>]) {
        let supports_cp = self.column.data_type().supports_cp();
        let mut row = first_row;
        let mut rest = keys;
        while !rest.is_empty() {
            while row > self.last_input_row_in_extent() {
                self.last_input_row_in_extent_inc();
            }
            let last = self.last_input_row_in_extent();
            let n = ((last - row + 1) as usize).min(rest.len());
            let range = if supports_cp {
                rest[..n].iter().flatten().fold(None, |acc, &v| match acc {
                    None => Some((v, v)),
                    Some((min, max)) => Some((v.min(min), v.max(max))),
                })
            } else {
                None
            };
            self.cp.add_or_update_entry(last, range);
            row += n as u64;
            rest = &rest[n..];
            if row > last {
                self.last_input_row_in_extent_inc();
            }
        }
    }

    /// Last row (0-based, counted from the start of the job) of the extent
    /// currently being parsed.
    pub fn last_input_row_in_extent(&self) -> RowId {
        self.last_input_row_in_extent.load(Ordering::Acquire)
    }

    /// Moves on to the next extent's rows. A partial extent resumed on
    /// another volume only takes the rows it has room for.
    pub fn last_input_row_in_extent_inc(&self) {
        let rows = self
            .resumed_extent_rows
            .lock()
            .pop_front()
            .unwrap_or(self.options.rows_per_extent);
        self.last_input_row_in_extent
            .fetch_add(rows, Ordering::AcqRel);
    }

    /// Asks the tracker which partial extents rotation will resume after the
    /// current one.
    fn plan_resumed_extents(&self) {
        let rows = self.tracker.resumed_extent_rows();
        if !rows.is_empty() {
            debug!(column = self.column.name(), ?rows, "planned resumed extents");
        }
        *self.resumed_extent_rows.lock() = rows.into();
    }

    pub fn set_last_input_row_in_extent(&self, row: RowId) {
        self.last_input_row_in_extent.store(row, Ordering::Release);
    }

    pub fn init_auto_inc(&self, table_name: &str, next_value: u64) -> BulkLoadResult<()> {
        let mut auto_inc = self.auto_inc.lock();
        let auto_inc = auto_inc.as_mut().ok_or_else(|| {
            TracedBulkLoadError::auto_increment(format!(
                "column {} is not auto-increment",
                self.column.name()
            ))
        })?;
        auto_inc.init(table_name, next_value)
    }

    /// Reserves `count` auto-increment values and returns the first.
    pub fn reserve_auto_inc_nums(&self, count: u64) -> BulkLoadResult<u64> {
        let mut auto_inc = self.auto_inc.lock();
        match auto_inc.as_mut() {
            Some(auto_inc) => auto_inc.reserve(count),
            None => Err(TracedBulkLoadError::auto_increment(format!(
                "column {} is not auto-increment",
                self.column.name()
            ))),
        }
    }

    /// Returns the next auto-increment value to save to the catalog.
    pub fn finish_auto_inc(&self) -> BulkLoadResult<Option<u64>> {
        match self.auto_inc.lock().as_mut() {
            Some(auto_inc) => auto_inc.finish().map(Some),
            None => Ok(None),
        }
    }

    /// Stores dictionary values in the open store and returns their tokens.
    pub fn update_dctnry_store(&self, values: &[Option<&[u8]>]) -> BulkLoadResult<Vec<u64>> {
        let dictionary = self.dictionary.as_ref().ok_or_else(|| {
            TracedBulkLoadError::logic(format!(
                "column {} has no dictionary",
                self.column.name()
            ))
        })?;
        dictionary.lock().insert(values)
    }

    pub fn inc_saturated_cnt(&self, count: u64) {
        self.saturated_rows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn saturated_cnt(&self) -> u64 {
        self.saturated_rows.load(Ordering::Relaxed)
    }

    pub fn set_relative_col_width_factor(&self, factor: u32) {
        self.width_factor.store(factor, Ordering::Relaxed);
    }

    /// Width of this column relative to the narrowest column of the table.
    pub fn relative_col_width_factor(&self) -> u32 {
        self.width_factor.load(Ordering::Relaxed)
    }

    pub fn print_cp_info(&self) {
        let data_type = self.column.data_type();
        self.cp
            .print(data_type.char_len().is_some() && !data_type.is_dictionary());
    }

    pub fn cp_entries(&self) -> Vec<CpEntry> {
        self.cp.entries()
    }

    /// Extents allocated by this column during the job, the delayed first
    /// extent included.
    pub fn extents_added(&self) -> u64 {
        self.inner.lock().extents_added
    }

    /// Writes every buffered row and closes the segment file and dictionary
    /// store.
    pub fn finish_parsing(&self) -> BulkLoadResult<()> {
        let mut guard = self.lock();
        let result = guard.finish();
        guard.track(result)
    }

    pub fn get_seg_file_info(&self) -> SegmentFileInfo {
        self.lock().seg_file_info()
    }

    /// Adds this column's extent-map changes to `report`. A failed column
    /// has nothing trustworthy to report.
    pub fn get_brm_update_info(&self, report: &mut ExtentMapReport) -> BulkLoadResult<()> {
        let guard = self.lock();
        if guard.state() == LoadState::Error {
            return Err(TracedBulkLoadError::invalid_state(format!(
                "column {} failed, not reporting its extents",
                self.column.name()
            )));
        }
        report.push(guard.extent_update());
        Ok(())
    }

    /// Dictionary blocks written by the job, for flushing cached copies.
    pub fn get_dict_flush_blks(&self) -> Vec<DictionaryBlocks> {
        self.lock().dict_flush_blocks().to_vec()
    }

    /// Closes everything without flushing and marks the column failed.
    pub fn abort(&self) {
        let mut guard = self.lock();
        if let Err(e) = guard.abort() {
            warn!(column = self.column.name(), error = %e, "failed to abort column");
        }
    }
}
