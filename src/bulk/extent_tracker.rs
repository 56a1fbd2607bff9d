// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Placement of a column's extents across the volumes assigned to a job.
//!
//! Every column of a table owns one [`VolumeExtentTracker`]. The reference
//! column picks the first segment file with
//! [`select_first_seg_file`](VolumeExtentTracker::select_first_seg_file) and
//! all other columns copy that choice with
//! [`assign_first_seg_file`](VolumeExtentTracker::assign_first_seg_file).
//! Afterwards each tracker rotates independently. Columns rotate in lock step
//! as long as every extent they move to takes the same number of rows, so a
//! partially filled extent is only resumed when it has the same room left in
//! every column.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::{AllocatedExtent, BulkLoadOptions, BulkLoadResult, TracedBulkLoadError, VolumeHwmInfo};
use crate::types::{Hwm, Lbid, Oid, PartitionId, SegmentId, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentState {
    /// The last extent on the volume has room for more rows.
    PartialExtent,
    /// The column has no extents on the volume.
    EmptyVolume,
    /// The last extent on the volume is full. The next one must be allocated.
    ExtentBoundary,
}

/// The pending extent of a column on one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeExtentInfo {
    pub partition: PartitionId,
    pub volume: VolumeId,
    pub segment: SegmentId,
    pub start_lbid: Lbid,
    pub local_hwm: Hwm,
    pub volume_total_blocks: u64,
    pub state: ExtentState,
}

impl VolumeExtentInfo {
    fn new(info: &VolumeHwmInfo, blocks_per_extent: u64) -> Self {
        let state = if info.total_blocks == 0 {
            ExtentState::EmptyVolume
        } else if (info.local_hwm + 1) % blocks_per_extent == 0 {
            ExtentState::ExtentBoundary
        } else {
            ExtentState::PartialExtent
        };
        Self {
            partition: info.partition,
            volume: info.volume,
            segment: info.segment,
            start_lbid: info.start_lbid,
            local_hwm: info.local_hwm,
            volume_total_blocks: info.total_blocks,
            state,
        }
    }
}

/// Result of [`VolumeExtentTracker::next_seg_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSegFile {
    /// A new extent must be allocated on `volume`. When `false`, rows go into
    /// the partial extent described by the remaining fields.
    pub new_extent: bool,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub local_hwm: Hwm,
    pub start_lbid: Lbid,
    pub state: ExtentState,
}

struct TrackerInner {
    current_idx: usize,
    extents: Vec<VolumeExtentInfo>,
    started_with_empty_volumes: bool,
}

pub struct VolumeExtentTracker {
    oid: Oid,
    blocks_per_extent: u64,
    rows_per_block: u64,
    inner: Mutex<TrackerInner>,
}

impl TrackerInner {
    /// The partial extent rotation resumes after leaving `current`.
    fn next_partial(&self, current: usize) -> Option<usize> {
        self.extents
            .iter()
            .enumerate()
            .filter(|(idx, e)| *idx != current && e.state == ExtentState::PartialExtent)
            .min_by_key(|(_, e)| e.volume)
            .map(|(idx, _)| idx)
    }
}

impl VolumeExtentTracker {
    /// Creates a tracker that rotates through `volumes` in the given order.
    pub fn new(oid: Oid, width: u32, volumes: &[VolumeHwmInfo], options: &BulkLoadOptions) -> Self {
        let blocks_per_extent = options.blocks_per_extent(width).max(1);
        let rows_per_block = (options.block_size as u64 / width.max(1) as u64).max(1);
        let extents = volumes
            .iter()
            .map(|info| VolumeExtentInfo::new(info, blocks_per_extent))
            .collect();
        Self {
            oid,
            blocks_per_extent,
            rows_per_block,
            inner: Mutex::new(TrackerInner {
                current_idx: 0,
                extents,
                started_with_empty_volumes: false,
            }),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn blocks_per_extent(&self) -> u64 {
        self.blocks_per_extent
    }

    /// Rows that fit into the extent holding `local_hwm` when writing resumes
    /// at the block after it. A HWM on the last block of an extent leaves a
    /// whole new extent.
    pub fn rows_left_after(&self, local_hwm: Hwm) -> u64 {
        (self.blocks_per_extent - (local_hwm + 1) % self.blocks_per_extent) * self.rows_per_block
    }

    /// Picks the segment file receiving the first rows of the job. Returns the
    /// selected extent and whether it is the first extent of the column on any
    /// of the tracked volumes.
    pub fn select_first_seg_file(&self) -> BulkLoadResult<(VolumeExtentInfo, bool)> {
        let mut inner = self.inner.lock();
        if inner.extents.is_empty() {
            return Err(TracedBulkLoadError::no_volumes(self.oid));
        }

        if inner
            .extents
            .iter()
            .all(|e| e.state == ExtentState::EmptyVolume)
        {
            inner.current_idx = 0;
            inner.started_with_empty_volumes = true;
            let first = &mut inner.extents[0];
            first.partition = 0;
            first.segment = 0;
            let first = *first;
            info!(
                oid = self.oid,
                volume = first.volume,
                "no extents on any volume, starting with partition 0 segment 0"
            );
            return Ok((first, true));
        }

        let partial = inner
            .extents
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == ExtentState::PartialExtent)
            .min_by_key(|(_, e)| (e.partition, e.segment, e.volume))
            .map(|(idx, _)| idx);
        let idx = match partial {
            Some(idx) => idx,
            None => inner
                .extents
                .iter()
                .enumerate()
                .min_by_key(|(idx, e)| (e.volume_total_blocks, *idx))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        };
        inner.current_idx = idx;
        let selected = inner.extents[idx];
        info!(
            oid = self.oid,
            volume = selected.volume,
            partition = selected.partition,
            segment = selected.segment,
            hwm = selected.local_hwm,
            state = ?selected.state,
            "selected first segment file"
        );
        Ok((selected, selected.state == ExtentState::EmptyVolume))
    }

    /// Starts on the same volume, partition and segment as `reference`. The
    /// HWM and LBID of this column's own extent are kept.
    pub fn assign_first_seg_file(
        &self,
        reference: &VolumeExtentTracker,
    ) -> BulkLoadResult<(VolumeExtentInfo, bool)> {
        let (ref_idx, ref_extent, ref_volumes, ref_started_empty) = {
            let r = reference.inner.lock();
            let volumes: Vec<VolumeId> = r.extents.iter().map(|e| e.volume).collect();
            let extent = r
                .extents
                .get(r.current_idx)
                .copied()
                .ok_or_else(|| TracedBulkLoadError::no_volumes(reference.oid))?;
            (r.current_idx, extent, volumes, r.started_with_empty_volumes)
        };

        let mut inner = self.inner.lock();
        let volumes: Vec<VolumeId> = inner.extents.iter().map(|e| e.volume).collect();
        if volumes != ref_volumes {
            return Err(TracedBulkLoadError::logic(format!(
                "volumes {volumes:?} of column {} differ from reference column {} volumes {ref_volumes:?}",
                self.oid, reference.oid
            )));
        }
        inner.current_idx = ref_idx;
        inner.started_with_empty_volumes = ref_started_empty;
        let extent = &mut inner.extents[ref_idx];
        extent.partition = ref_extent.partition;
        extent.segment = ref_extent.segment;
        extent.state = ref_extent.state;
        let extent = *extent;
        Ok((
            extent,
            ref_started_empty || extent.state == ExtentState::EmptyVolume,
        ))
    }

    /// Moves on to the volume receiving the next extent's worth of rows.
    ///
    /// In priority order: a partially filled extent on another volume (lowest
    /// volume id first), then the next volume in rotation. The volume left
    /// behind is marked as being at an extent boundary.
    pub fn next_seg_file(&self) -> BulkLoadResult<NextSegFile> {
        let mut inner = self.inner.lock();
        if inner.extents.is_empty() {
            return Err(TracedBulkLoadError::no_volumes(self.oid));
        }
        let current = inner.current_idx;
        if let Some(extent) = inner.extents.get_mut(current) {
            extent.state = ExtentState::ExtentBoundary;
        }

        let next = inner
            .next_partial(current)
            .unwrap_or((current + 1) % inner.extents.len());
        inner.current_idx = next;
        let extent = inner.extents[next];
        let next = match extent.state {
            ExtentState::PartialExtent => NextSegFile {
                new_extent: false,
                volume: extent.volume,
                partition: extent.partition,
                segment: extent.segment,
                local_hwm: extent.local_hwm,
                start_lbid: extent.start_lbid,
                state: extent.state,
            },
            ExtentState::EmptyVolume => NextSegFile {
                new_extent: true,
                volume: extent.volume,
                partition: 0,
                segment: 0,
                local_hwm: 0,
                start_lbid: 0,
                state: extent.state,
            },
            ExtentState::ExtentBoundary => NextSegFile {
                new_extent: true,
                volume: extent.volume,
                partition: extent.partition,
                segment: extent.segment,
                local_hwm: extent.local_hwm,
                start_lbid: extent.start_lbid,
                state: extent.state,
            },
        };
        Ok(next)
    }

    /// Rows taken by each partial extent that rotation will resume, in the
    /// order they are resumed. Every extent after those is a new one and
    /// takes a full extent's worth of rows.
    pub fn resumed_extent_rows(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut planned = TrackerInner {
            current_idx: inner.current_idx,
            extents: inner.extents.clone(),
            started_with_empty_volumes: inner.started_with_empty_volumes,
        };
        drop(inner);

        let mut rows = vec![];
        while let Some(current) = planned.extents.get_mut(planned.current_idx) {
            current.state = ExtentState::ExtentBoundary;
            let Some(next) = planned.next_partial(planned.current_idx) else {
                break;
            };
            rows.push(self.rows_left_after(planned.extents[next].local_hwm));
            planned.current_idx = next;
        }
        rows
    }

    /// Partial extents on volumes other than the current one, with the rows
    /// each has room for.
    pub fn partial_extent_rows(&self) -> Vec<(VolumeId, u64)> {
        let inner = self.inner.lock();
        inner
            .extents
            .iter()
            .enumerate()
            .filter(|(idx, e)| *idx != inner.current_idx && e.state == ExtentState::PartialExtent)
            .map(|(_, e)| (e.volume, self.rows_left_after(e.local_hwm)))
            .collect()
    }

    /// Stops rotation from resuming the partial extent on `volume`. The next
    /// rows for that volume go into a new extent instead.
    pub fn close_partial_extent(&self, volume: VolumeId) {
        let mut inner = self.inner.lock();
        if let Some(extent) = inner
            .extents
            .iter_mut()
            .find(|e| e.volume == volume && e.state == ExtentState::PartialExtent)
        {
            extent.state = ExtentState::ExtentBoundary;
            info!(oid = self.oid, volume, "partial extent will not be resumed");
        }
    }

    /// Records an extent allocated on the current volume.
    pub fn record_allocated(&self, extent: &AllocatedExtent) {
        let mut inner = self.inner.lock();
        let current = inner.current_idx;
        if let Some(info) = inner.extents.get_mut(current) {
            info.partition = extent.partition;
            info.segment = extent.segment;
            info.start_lbid = extent.start_lbid;
            info.local_hwm = extent.start_block;
            info.volume_total_blocks += extent.blocks;
            info.state = ExtentState::PartialExtent;
        }
    }

    pub fn current_volume_idx(&self) -> usize {
        self.inner.lock().current_idx
    }

    pub fn volume_extent_list(&self) -> Vec<VolumeExtentInfo> {
        self.inner.lock().extents.clone()
    }

    pub fn started_with_empty_volumes(&self) -> bool {
        self.inner.lock().started_with_empty_volumes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BulkLoadOptions {
        BulkLoadOptions::default_for_test("/tmp".into())
    }

    fn hwm_info(volume: VolumeId, partition: PartitionId, hwm: Hwm, blocks: u64) -> VolumeHwmInfo {
        VolumeHwmInfo {
            volume,
            partition,
            segment: 0,
            local_hwm: hwm,
            start_lbid: 1000 * volume as Lbid,
            total_blocks: blocks,
        }
    }

    #[test]
    fn test_classify() {
        // width 1: 8 blocks per extent
        let tracker = VolumeExtentTracker::new(
            1,
            1,
            &[hwm_info(1, 0, 3, 8), hwm_info(2, 0, 7, 8), VolumeHwmInfo::empty(3)],
            &options(),
        );
        let states: Vec<_> = tracker
            .volume_extent_list()
            .iter()
            .map(|e| e.state)
            .collect();
        assert_eq!(
            states,
            vec![
                ExtentState::PartialExtent,
                ExtentState::ExtentBoundary,
                ExtentState::EmptyVolume
            ]
        );
    }

    #[test]
    fn test_select_first_all_empty() {
        let tracker = VolumeExtentTracker::new(
            1,
            4,
            &[VolumeHwmInfo::empty(3), VolumeHwmInfo::empty(1)],
            &options(),
        );
        let (first, first_extent) = tracker.select_first_seg_file().unwrap();
        assert!(first_extent);
        assert_eq!(first.volume, 3);
        assert_eq!((first.partition, first.segment), (0, 0));
        assert_eq!(first.state, ExtentState::EmptyVolume);
        assert!(tracker.started_with_empty_volumes());
    }

    #[test]
    fn test_select_first_no_volumes() {
        let tracker = VolumeExtentTracker::new(1, 4, &[], &options());
        assert!(tracker.select_first_seg_file().is_err());
    }

    #[test]
    fn test_select_first_prefers_lowest_partial() {
        let tracker = VolumeExtentTracker::new(
            1,
            1,
            &[hwm_info(1, 2, 3, 24), hwm_info(2, 1, 4, 16), hwm_info(3, 0, 7, 8)],
            &options(),
        );
        let (first, first_extent) = tracker.select_first_seg_file().unwrap();
        assert!(!first_extent);
        assert_eq!(first.volume, 2);
        assert_eq!(tracker.current_volume_idx(), 1);
    }

    #[test]
    fn test_select_first_fewest_blocks() {
        let tracker = VolumeExtentTracker::new(
            1,
            1,
            &[hwm_info(1, 0, 15, 16), hwm_info(2, 0, 7, 8), hwm_info(3, 0, 7, 8)],
            &options(),
        );
        let (first, _) = tracker.select_first_seg_file().unwrap();
        assert_eq!(first.volume, 2);
        assert_eq!(first.state, ExtentState::ExtentBoundary);
    }

    #[test]
    fn test_assign_first() {
        let volumes = [hwm_info(1, 0, 15, 16), hwm_info(2, 0, 2, 8)];
        let reference = VolumeExtentTracker::new(1, 1, &volumes, &options());
        reference.select_first_seg_file().unwrap();
        let sibling = VolumeExtentTracker::new(2, 4, &volumes, &options());
        let (info, first_extent) = sibling.assign_first_seg_file(&reference).unwrap();
        assert!(!first_extent);
        assert_eq!(info.volume, 2);
        assert_eq!(info.state, ExtentState::PartialExtent);
        assert_eq!(sibling.current_volume_idx(), reference.current_volume_idx());

        let other = VolumeExtentTracker::new(3, 4, &volumes[..1], &options());
        assert!(other.assign_first_seg_file(&reference).is_err());
    }

    #[test]
    fn test_next_seg_file_rotation() {
        let tracker = VolumeExtentTracker::new(
            1,
            1,
            &[
                VolumeHwmInfo::empty(1),
                VolumeHwmInfo::empty(2),
                VolumeHwmInfo::empty(3),
            ],
            &options(),
        );
        tracker.select_first_seg_file().unwrap();
        let next = tracker.next_seg_file().unwrap();
        assert!(next.new_extent);
        assert_eq!((next.volume, next.partition, next.segment), (2, 0, 0));
        assert_eq!(next.state, ExtentState::EmptyVolume);
        assert_eq!(tracker.next_seg_file().unwrap().volume, 3);
        let wrapped = tracker.next_seg_file().unwrap();
        assert_eq!(wrapped.volume, 1);
        assert_eq!(wrapped.state, ExtentState::ExtentBoundary);
    }

    #[test]
    fn test_next_seg_file_prefers_partial() {
        let tracker = VolumeExtentTracker::new(
            1,
            1,
            &[hwm_info(1, 0, 3, 8), hwm_info(2, 0, 7, 8), hwm_info(3, 0, 5, 8)],
            &options(),
        );
        let (first, _) = tracker.select_first_seg_file().unwrap();
        assert_eq!(first.volume, 1);
        let next = tracker.next_seg_file().unwrap();
        assert!(!next.new_extent);
        assert_eq!(next.volume, 3);
        assert_eq!(next.local_hwm, 5);
        assert_eq!(next.start_lbid, 3000);
        let next = tracker.next_seg_file().unwrap();
        assert!(next.new_extent);
        assert_eq!(next.volume, 1);
    }

    #[test]
    fn test_next_seg_file_no_volumes() {
        let tracker = VolumeExtentTracker::new(1, 4, &[], &options());
        assert!(matches!(
            tracker.next_seg_file().unwrap_err().kind(),
            crate::bulk::BulkLoadError::NoVolumes(1)
        ));
    }

    #[test]
    fn test_resumed_extent_rows() {
        // width 4: 32 blocks of 16 rows per extent
        let tracker = VolumeExtentTracker::new(
            1,
            4,
            &[hwm_info(1, 0, 6, 32), hwm_info(2, 0, 6, 32), hwm_info(3, 0, 40, 64)],
            &options(),
        );
        let (first, _) = tracker.select_first_seg_file().unwrap();
        assert_eq!(first.volume, 1);
        assert_eq!(tracker.rows_left_after(first.local_hwm), 400);
        assert_eq!(tracker.rows_left_after(31), 512);
        assert_eq!(tracker.partial_extent_rows(), vec![(2, 400), (3, 368)]);
        assert_eq!(tracker.resumed_extent_rows(), vec![400, 368]);

        tracker.close_partial_extent(3);
        assert_eq!(tracker.resumed_extent_rows(), vec![400]);
        assert!(!tracker.next_seg_file().unwrap().new_extent);
        let next = tracker.next_seg_file().unwrap();
        assert!(next.new_extent);
        assert_eq!(next.volume, 3);
        assert!(tracker.resumed_extent_rows().is_empty());
    }

    #[test]
    fn test_single_volume_always_new_extent() {
        let tracker = VolumeExtentTracker::new(1, 8, &[VolumeHwmInfo::empty(1)], &options());
        tracker.select_first_seg_file().unwrap();
        for _ in 0..3 {
            let next = tracker.next_seg_file().unwrap();
            assert!(next.new_extent);
            assert_eq!(next.volume, 1);
        }
    }
}
