// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Extent-map deltas produced by a load job. All of them are sent to the
//! extent-map authority in one batch when the job finishes.

use serde::{Deserialize, Serialize};

use crate::types::{ColumnId, Hwm, Lbid, Oid, PartitionId, SegmentId, VolumeId};

/// New high water mark of one segment file touched by the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHwmUpdate {
    pub oid: Oid,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub hwm: Hwm,
}

/// Min/max range of one extent touched by the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentCpUpdate {
    pub start_lbid: Lbid,
    pub min: i64,
    pub max: i64,
    /// The extent was allocated by this job, so its range replaces any stored
    /// one instead of being merged into it.
    pub is_new_extent: bool,
}

/// State of the extent that held the HWM when the job started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedExtentState {
    pub start_lbid: Lbid,
    pub saved_hwm: Hwm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnExtentUpdate {
    pub column_id: ColumnId,
    pub oid: Oid,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    /// HWM of the segment file the column ended on.
    pub final_hwm: Hwm,
    pub hwm_updates: Vec<SegmentHwmUpdate>,
    pub cp_updates: Vec<ExtentCpUpdate>,
    /// Stored min/max of this extent must be dropped before `cp_updates` apply.
    pub invalidate: Option<SavedExtentState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMapReport {
    pub columns: Vec<ColumnExtentUpdate>,
}

impl ExtentMapReport {
    pub fn push(&mut self, update: ColumnExtentUpdate) {
        self.columns.push(update);
    }

    pub fn column(&self, column_id: ColumnId) -> Option<&ColumnExtentUpdate> {
        self.columns.iter().find(|c| c.column_id == column_id)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
