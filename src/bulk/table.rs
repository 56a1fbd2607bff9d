// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Coordinates the columns of one table during a load job.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    BulkLoadOptions, BulkLoadResult, ColumnLoader, ExtentMap, ExtentMapReport, ExtentState,
    InitialExtent, LockInfo, Status, TracedBulkLoadError, VolumeExtentInfo, VolumeExtentTracker,
};
use crate::catalog::JobColumn;
use crate::types::{encode_fixed, ColumnId, DataValue, RowId, VolumeId};

/// Outcome of a finished load job.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub table: String,
    pub rows: u64,
    pub saturated_rows: u64,
    /// Extents allocated per column, in column order.
    pub extents_added: Vec<u64>,
    pub report: ExtentMapReport,
    /// Next auto-increment value to store in the catalog.
    pub auto_inc_next: Option<u64>,
}

/// A column with its first segment file chosen, before it is set up.
struct PlacedColumn {
    column: JobColumn,
    tracker: Arc<VolumeExtentTracker>,
    first: VolumeExtentInfo,
    first_extent: bool,
}

pub struct TableLoader {
    name: String,
    extent_map: Arc<dyn ExtentMap>,
    columns: Vec<Arc<ColumnLoader>>,
    status: Mutex<LockInfo>,
    next_row: AtomicU64,
}

impl TableLoader {
    /// Prepares every column of `name` to load into `volumes`.
    ///
    /// The first column picks the segment file to start in; all others start
    /// in the matching segment file of their own. Columns must cross extent
    /// boundaries at the same rows, so a partial extent is only resumed when
    /// it has the same room left in every column.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<JobColumn>,
        volumes: &[VolumeId],
        extent_map: Arc<dyn ExtentMap>,
        options: Arc<BulkLoadOptions>,
    ) -> BulkLoadResult<Self> {
        let name = name.into();
        options.validate()?;
        if columns.is_empty() {
            return Err(TracedBulkLoadError::logic(format!(
                "table {name} has no columns"
            )));
        }
        let min_width = columns.iter().map(|c| c.width()).min().unwrap_or(1).max(1);

        let mut placed = Vec::with_capacity(columns.len());
        let mut reference: Option<Arc<VolumeExtentTracker>> = None;
        for column in columns {
            let infos = extent_map.volume_hwm_info(column.oid(), volumes)?;
            let tracker = Arc::new(VolumeExtentTracker::new(
                column.oid(),
                column.width(),
                &infos,
                &options,
            ));
            let (first, first_extent) = match &reference {
                None => tracker.select_first_seg_file()?,
                Some(reference) => tracker.assign_first_seg_file(reference)?,
            };
            reference.get_or_insert_with(|| tracker.clone());
            placed.push(PlacedColumn {
                column,
                tracker,
                first,
                first_extent,
            });
        }
        let skip_to_new_extent = Self::starting_rows_differ(&name, &placed);
        Self::close_uneven_partial_extents(&name, &placed);

        let mut loaders = Vec::with_capacity(placed.len());
        for (idx, placed) in placed.into_iter().enumerate() {
            let PlacedColumn {
                column,
                tracker,
                first,
                first_extent,
            } = placed;
            let width = column.width();
            let loader = ColumnLoader::new(
                idx as ColumnId,
                column,
                name.clone(),
                tracker.clone(),
                extent_map.clone(),
                options.clone(),
            )?;
            loader.set_relative_col_width_factor(width / min_width);

            if first.state == ExtentState::EmptyVolume {
                loader.setup_delayed_file_creation(first.volume, first.partition, first.segment, 0);
            } else {
                let hwm = first.local_hwm + 1;
                loader.setup_initial_column_extent(InitialExtent {
                    volume: first.volume,
                    partition: first.partition,
                    segment: first.segment,
                    table_name: name.clone(),
                    lbid: first.start_lbid,
                    old_hwm: first.local_hwm,
                    hwm,
                    skipped_to_new_extent: skip_to_new_extent
                        || hwm % tracker.blocks_per_extent() == 0,
                    is_new_extent: false,
                })?;
            }
            info!(
                table = %name,
                column = loader.column().name(),
                volume = first.volume,
                partition = first.partition,
                segment = first.segment,
                first_extent,
                "column ready"
            );
            loaders.push(Arc::new(loader));
        }

        let table = Self {
            name,
            extent_map,
            columns: loaders,
            status: Mutex::new(LockInfo::default()),
            next_row: AtomicU64::new(0),
        };
        table.check_last_input_rows()?;
        Ok(table)
    }

    /// Whether the columns would resume their starting extents at different
    /// rows. They then all start in a new extent instead.
    fn starting_rows_differ(name: &str, placed: &[PlacedColumn]) -> bool {
        let rows_left: Vec<u64> = placed
            .iter()
            .filter(|p| p.first.state != ExtentState::EmptyVolume)
            .map(|p| p.tracker.rows_left_after(p.first.local_hwm))
            .collect();
        if rows_left.iter().all_equal() {
            return false;
        }
        warn!(
            table = name,
            ?rows_left,
            "columns end at different rows of their extents, starting new extents"
        );
        true
    }

    /// Keeps rotation from resuming partial extents whose room differs
    /// between the columns.
    fn close_uneven_partial_extents(name: &str, placed: &[PlacedColumn]) {
        let partials: Vec<Vec<(VolumeId, u64)>> = placed
            .iter()
            .map(|p| p.tracker.partial_extent_rows())
            .collect();
        let volumes: BTreeSet<VolumeId> = partials.iter().flatten().map(|(v, _)| *v).collect();
        for volume in volumes {
            let rows_left: Vec<Option<u64>> = partials
                .iter()
                .map(|p| p.iter().find(|(v, _)| *v == volume).map(|(_, rows)| *rows))
                .collect();
            if rows_left.iter().all(Option::is_some) && rows_left.iter().all_equal() {
                continue;
            }
            warn!(
                table = name,
                volume,
                ?rows_left,
                "columns have different room in partial extents, not resuming them"
            );
            for p in placed {
                p.tracker.close_partial_extent(volume);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Arc<ColumnLoader>] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Option<&Arc<ColumnLoader>> {
        self.columns.get(id as usize)
    }

    pub fn status(&self) -> Status {
        self.status.lock().status
    }

    /// Rows accepted so far.
    pub fn rows(&self) -> u64 {
        self.next_row.load(Ordering::Acquire)
    }

    /// Checks that every column crosses extent boundaries at the same rows
    /// as the first one.
    fn check_last_input_rows(&self) -> BulkLoadResult<()> {
        let Some((first, rest)) = self.columns.split_first() else {
            return Ok(());
        };
        let last_row = first.last_input_row_in_extent();
        for column in rest {
            let own = column.last_input_row_in_extent();
            if own != last_row {
                return Err(TracedBulkLoadError::logic(format!(
                    "column {} of table {} ends its extent at row {own}, column {} at row {last_row}",
                    column.column().name(),
                    self.name,
                    first.column().name(),
                )));
            }
        }
        Ok(())
    }

    /// Starts auto-increment columns from `next_value`.
    pub fn init_auto_inc(&self, next_value: u64) -> BulkLoadResult<()> {
        for column in &self.columns {
            if column.column().is_auto_increment() {
                column.init_auto_inc(&self.name, next_value)?;
            }
        }
        Ok(())
    }

    /// Loads one batch of rows, given column by column. Returns the number of
    /// rows loaded.
    ///
    /// A failing column does not stop the others from taking the batch, but
    /// the table is marked failed and the first error is returned.
    pub fn load_batch(&self, batch: Vec<Vec<DataValue>>) -> BulkLoadResult<u64> {
        {
            let mut status = self.status.lock();
            if status.status == Status::Error {
                return Err(TracedBulkLoadError::invalid_state(format!(
                    "table {} failed",
                    self.name
                )));
            }
            status.status = Status::ReadInProgress;
        }
        if batch.len() != self.columns.len() {
            return Err(TracedBulkLoadError::logic(format!(
                "batch has {} columns, table {} has {}",
                batch.len(),
                self.name,
                self.columns.len()
            )));
        }
        let rows = batch.first().map_or(0, |c| c.len()) as u64;
        if batch.iter().any(|c| c.len() as u64 != rows) {
            return Err(TracedBulkLoadError::logic("columns of a batch differ in length"));
        }
        if rows == 0 {
            return Ok(0);
        }

        let first_row = self.next_row.fetch_add(rows, Ordering::AcqRel);
        let mut first_error = None;
        for (column, values) in self.columns.iter().zip(batch) {
            if let Err(e) = Self::load_column(column, first_row, values) {
                warn!(
                    table = %self.name,
                    column = column.column().name(),
                    first_row,
                    error = %e,
                    "failed to load batch"
                );
                first_error.get_or_insert(e);
            }
        }
        let result = match first_error {
            Some(e) => Err(e),
            None => self.check_last_input_rows(),
        };
        if let Err(e) = result {
            self.status.lock().status = Status::Error;
            return Err(e);
        }
        Ok(rows)
    }

    fn load_column(
        column: &ColumnLoader,
        first_row: RowId,
        mut values: Vec<DataValue>,
    ) -> BulkLoadResult<()> {
        let data_type = column.column().data_type();
        if column.column().is_auto_increment() {
            let nulls = values.iter().filter(|v| **v == DataValue::Null).count() as u64;
            if nulls > 0 {
                let mut next = column.reserve_auto_inc_nums(nulls)?;
                for value in values.iter_mut().filter(|v| **v == DataValue::Null) {
                    *value = DataValue::Int(next as i64);
                    next += 1;
                }
            }
        }

        let mut section = column.reserve_section(values.len() as u64)?;
        let mut keys = Vec::with_capacity(values.len());
        let mut saturated = 0;
        if data_type.is_dictionary() {
            let max_len = data_type.char_len().unwrap_or(u32::MAX) as usize;
            let mut strings = Vec::with_capacity(values.len());
            for value in values {
                let mut bytes = match value {
                    DataValue::Null => {
                        strings.push(None);
                        continue;
                    }
                    DataValue::Int(v) => v.to_string().into_bytes(),
                    DataValue::String(s) => s.into_bytes(),
                };
                if bytes.len() > max_len {
                    bytes.truncate(max_len);
                    saturated += 1;
                }
                strings.push(Some(bytes));
            }
            keys.resize(strings.len(), None);
            section.set_strings(strings)?;
        } else {
            let buf = section.fixed_mut()?;
            for value in &values {
                let encoded = encode_fixed(data_type, value, &mut *buf);
                keys.push(encoded.cp_key);
                if encoded.saturated {
                    saturated += 1;
                }
            }
        }

        column.update_cp_for_rows(first_row, &keys);
        if saturated > 0 {
            column.inc_saturated_cnt(saturated);
        }
        column.release_section(section)
    }

    /// Writes out all remaining rows, closes every column and applies the
    /// job's extent-map changes in one batch.
    pub fn finish(&self) -> BulkLoadResult<LoadSummary> {
        if self.status() == Status::Error {
            self.abort();
            return Err(TracedBulkLoadError::invalid_state(format!(
                "table {} failed",
                self.name
            )));
        }
        for column in &self.columns {
            if let Err(e) = column.finish_parsing() {
                self.abort();
                return Err(e);
            }
        }
        self.status.lock().status = Status::ReadComplete;

        let mut report = ExtentMapReport::default();
        for column in &self.columns {
            column.print_cp_info();
            column.get_brm_update_info(&mut report)?;
        }
        self.extent_map.apply_updates(&report)?;

        let mut auto_inc_next = None;
        for column in &self.columns {
            if let Some(next) = column.finish_auto_inc()? {
                auto_inc_next.get_or_insert(next);
            }
        }
        let summary = LoadSummary {
            table: self.name.clone(),
            rows: self.rows(),
            saturated_rows: self.columns.iter().map(|c| c.saturated_cnt()).sum(),
            extents_added: self.columns.iter().map(|c| c.extents_added()).collect(),
            report,
            auto_inc_next,
        };
        self.status.lock().release(Status::ParseComplete);
        info!(
            table = %self.name,
            rows = summary.rows,
            saturated_rows = summary.saturated_rows,
            "finished loading table"
        );
        Ok(summary)
    }

    /// Drops everything not yet written and marks the table failed. Nothing
    /// is reported to the extent map.
    pub fn abort(&self) {
        for column in &self.columns {
            column.abort();
        }
        self.status.lock().release(Status::Error);
        warn!(table = %self.name, "aborted load");
    }
}
