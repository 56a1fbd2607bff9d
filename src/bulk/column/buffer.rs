// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Row sections of a column waiting to be written.
//!
//! Sections are reserved in row order under the column lock, filled by the
//! parser without holding any lock, and released again. Released sections are
//! written strictly in row order, so a section released early waits for all
//! sections before it.

use std::collections::{BTreeMap, BTreeSet};

use bytes::BytesMut;

use crate::bulk::{BulkLoadResult, TracedBulkLoadError};
use crate::types::RowId;

/// Encoded rows of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionData {
    /// `width` bytes per row.
    Fixed(BytesMut),
    /// Values of a dictionary column. They are turned into tokens when written,
    /// so that a token always refers to the store paired with its segment file.
    Strings(Vec<Option<Vec<u8>>>),
}

#[derive(Debug)]
pub struct Section {
    start_row: RowId,
    row_count: u64,
    data: SectionData,
}

impl Section {
    pub fn start_row(&self) -> RowId {
        self.start_row
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn data(&self) -> &SectionData {
        &self.data
    }

    /// Buffer to append fixed-width values to.
    pub fn fixed_mut(&mut self) -> BulkLoadResult<&mut BytesMut> {
        match &mut self.data {
            SectionData::Fixed(buf) => Ok(buf),
            SectionData::Strings(_) => Err(TracedBulkLoadError::logic(
                "dictionary column section holds strings",
            )),
        }
    }

    pub fn set_strings(&mut self, values: Vec<Option<Vec<u8>>>) -> BulkLoadResult<()> {
        match &mut self.data {
            SectionData::Strings(v) => {
                *v = values;
                Ok(())
            }
            SectionData::Fixed(_) => Err(TracedBulkLoadError::logic(
                "fixed-width column section holds bytes",
            )),
        }
    }

    fn validate(&self, width: u32) -> BulkLoadResult<()> {
        let (len, expected) = match &self.data {
            SectionData::Fixed(buf) => (buf.len() as u64, self.row_count * width as u64),
            SectionData::Strings(v) => (v.len() as u64, self.row_count),
        };
        if len != expected {
            return Err(TracedBulkLoadError::logic(format!(
                "section at row {} holds {len} units, expected {expected}",
                self.start_row
            )));
        }
        Ok(())
    }
}

pub struct ColumnBufferManager {
    width: u32,
    dictionary: bool,
    /// Rows accumulated before released sections are written.
    flush_rows: u64,
    next_reserve_row: RowId,
    next_write_row: RowId,
    outstanding: BTreeSet<RowId>,
    released: BTreeMap<RowId, Section>,
}

impl ColumnBufferManager {
    pub fn new(width: u32, dictionary: bool, flush_rows: u64) -> Self {
        Self {
            width,
            dictionary,
            flush_rows,
            next_reserve_row: 0,
            next_write_row: 0,
            outstanding: BTreeSet::new(),
            released: BTreeMap::new(),
        }
    }

    /// Reserves the next `row_count` rows.
    pub fn reserve(&mut self, row_count: u64) -> Section {
        let start_row = self.next_reserve_row;
        self.next_reserve_row += row_count;
        self.outstanding.insert(start_row);
        let data = if self.dictionary {
            SectionData::Strings(Vec::with_capacity(row_count as usize))
        } else {
            SectionData::Fixed(BytesMut::with_capacity((row_count * self.width as u64) as usize))
        };
        Section {
            start_row,
            row_count,
            data,
        }
    }

    pub fn release(&mut self, section: Section) -> BulkLoadResult<()> {
        if !self.outstanding.contains(&section.start_row) {
            return Err(TracedBulkLoadError::logic(format!(
                "section at row {} was not reserved",
                section.start_row
            )));
        }
        section.validate(self.width)?;
        self.outstanding.remove(&section.start_row);
        self.released.insert(section.start_row, section);
        Ok(())
    }

    /// Takes the released sections that can be written now, in row order.
    /// Unless `force` is set, nothing is returned until at least `flush_rows`
    /// rows are ready.
    pub fn take_ready(&mut self, force: bool) -> Vec<Section> {
        let mut ready_rows = 0;
        let mut row = self.next_write_row;
        for (start, section) in self.released.range(self.next_write_row..) {
            if *start != row {
                break;
            }
            ready_rows += section.row_count;
            row += section.row_count;
        }
        if ready_rows == 0 || (!force && ready_rows < self.flush_rows) {
            return vec![];
        }
        let mut sections = vec![];
        while let Some(section) = self.released.remove(&self.next_write_row) {
            self.next_write_row += section.row_count;
            sections.push(section);
        }
        sections
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Rows released but not written yet.
    pub fn buffered_rows(&self) -> u64 {
        self.released.values().map(|s| s.row_count).sum()
    }

    pub fn next_write_row(&self) -> RowId {
        self.next_write_row
    }

    /// Drops everything that has not been written.
    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.released.clear();
    }
}
