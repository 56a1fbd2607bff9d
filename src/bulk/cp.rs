// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Casual partitioning (CP) statistics: the min/max value of every extent a
//! job writes to.
//!
//! Entries are created by the parsing side, keyed by the last input row of the
//! logical extent they cover. The LBID of the extent is only known once the
//! writing side allocates or opens it, so LBIDs are matched to entries in
//! order: the n-th extent the column writes to belongs to the n-th entry.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::ExtentCpUpdate;
use crate::types::{Lbid, RowId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpEntry {
    pub last_input_row: RowId,
    pub start_lbid: Option<Lbid>,
    pub min: i64,
    pub max: i64,
    pub is_new_extent: bool,
    /// At least one non-null value was seen.
    pub has_values: bool,
}

impl CpEntry {
    fn new(last_input_row: RowId) -> Self {
        Self {
            last_input_row,
            start_lbid: None,
            min: i64::MAX,
            max: i64::MIN,
            is_new_extent: true,
            has_values: false,
        }
    }

    fn merge(&mut self, min: i64, max: i64) {
        self.min = self.min.min(min);
        self.max = self.max.max(max);
        self.has_values = true;
    }
}

#[derive(Default)]
struct CpTrackerInner {
    entries: Vec<CpEntry>,
    /// Index of the first entry still waiting for its LBID.
    next_unassigned: usize,
    /// LBIDs of extents opened before the parser created their entries.
    pending: VecDeque<(Lbid, bool)>,
}

impl CpTrackerInner {
    fn push(&mut self, mut entry: CpEntry) {
        if self.next_unassigned == self.entries.len() {
            if let Some((lbid, is_new)) = self.pending.pop_front() {
                entry.start_lbid = Some(lbid);
                entry.is_new_extent = is_new;
                self.next_unassigned += 1;
            }
        }
        debug!(
            last_input_row = entry.last_input_row,
            start_lbid = ?entry.start_lbid,
            "new CP entry"
        );
        self.entries.push(entry);
    }
}

/// Min/max tracker of one column.
#[derive(Default)]
pub struct CpTracker {
    inner: Mutex<CpTrackerInner>,
}

impl CpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the entry of the extent the job starts in.
    pub fn add_first_entry(&self, last_input_row: RowId, lbid: Option<Lbid>, is_new_extent: bool) {
        let mut inner = self.inner.lock();
        let mut entry = CpEntry::new(last_input_row);
        entry.is_new_extent = is_new_extent;
        if let Some(lbid) = lbid {
            entry.start_lbid = Some(lbid);
            inner.next_unassigned = inner.entries.len() + 1;
        }
        inner.push(entry);
    }

    /// Merges a value range into the entry ending at `last_input_row`,
    /// creating it if this is the first range seen for that extent. `None`
    /// only makes sure the entry exists.
    pub fn add_or_update_entry(&self, last_input_row: RowId, range: Option<(i64, i64)>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.last_input_row == last_input_row)
        {
            if let Some((min, max)) = range {
                entry.merge(min, max);
            }
            return;
        }
        if let Some(last) = inner.entries.last() {
            if last.last_input_row > last_input_row {
                warn!(
                    last_input_row,
                    previous = last.last_input_row,
                    "CP update out of row order, starting a new entry"
                );
            }
        }
        let mut entry = CpEntry::new(last_input_row);
        if let Some((min, max)) = range {
            entry.merge(min, max);
        }
        inner.push(entry);
    }

    /// Attaches the LBID of the extent the column just moved to.
    pub fn set_current_entry_lbid(&self, lbid: Lbid, is_new_extent: bool) {
        let mut inner = self.inner.lock();
        let idx = inner.next_unassigned;
        if let Some(entry) = inner.entries.get_mut(idx) {
            entry.start_lbid = Some(lbid);
            entry.is_new_extent = is_new_extent;
            inner.next_unassigned += 1;
        } else {
            inner.pending.push_back((lbid, is_new_extent));
        }
    }

    pub fn entries(&self) -> Vec<CpEntry> {
        self.inner.lock().entries.clone()
    }

    /// Updates for every entry that has both an extent and values.
    pub fn updates(&self) -> Vec<ExtentCpUpdate> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| e.has_values)
            .filter_map(|e| {
                e.start_lbid.map(|start_lbid| ExtentCpUpdate {
                    start_lbid,
                    min: e.min,
                    max: e.max,
                    is_new_extent: e.is_new_extent,
                })
            })
            .collect()
    }

    /// Logs all entries at debug level.
    pub fn print(&self, as_char: bool) {
        let inner = self.inner.lock();
        for e in &inner.entries {
            if as_char && e.has_values {
                debug!(
                    last_input_row = e.last_input_row,
                    start_lbid = ?e.start_lbid,
                    min = %String::from_utf8_lossy(&((e.min as u64) ^ (1 << 63)).to_be_bytes()),
                    max = %String::from_utf8_lossy(&((e.max as u64) ^ (1 << 63)).to_be_bytes()),
                    is_new_extent = e.is_new_extent,
                    "CP entry"
                );
            } else {
                debug!(
                    last_input_row = e.last_input_row,
                    start_lbid = ?e.start_lbid,
                    min = e.min,
                    max = e.max,
                    has_values = e.has_values,
                    is_new_extent = e.is_new_extent,
                    "CP entry"
                );
            }
        }
    }
}
