// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The extent-map authority: owns extent allocation, segment file HWMs and
//! per-extent min/max ranges. A load job only reads a snapshot of it at start,
//! allocates extents while running, and sends all of its changes back in one
//! [`ExtentMapReport`] at the end.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BulkLoadOptions, BulkLoadResult, ExtentMapReport, TracedBulkLoadError};
use crate::types::{Hwm, Lbid, Oid, PartitionId, SegmentId, VolumeId};

/// Where a column currently ends on one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHwmInfo {
    pub volume: VolumeId,
    /// Partition of the last segment file of the column on this volume.
    pub partition: PartitionId,
    pub segment: SegmentId,
    /// HWM of that segment file.
    pub local_hwm: Hwm,
    /// Starting LBID of the extent holding `local_hwm`.
    pub start_lbid: Lbid,
    /// Blocks allocated to the column on this volume. `0` means the column has
    /// never been stored there.
    pub total_blocks: u64,
}

impl VolumeHwmInfo {
    pub fn empty(volume: VolumeId) -> Self {
        Self {
            volume,
            partition: 0,
            segment: 0,
            local_hwm: 0,
            start_lbid: 0,
            total_blocks: 0,
        }
    }
}

/// An extent handed out by [`ExtentMap::create_column_extent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedExtent {
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub start_lbid: Lbid,
    /// File-relative block where the extent begins.
    pub start_block: u64,
    pub blocks: u64,
}

/// Authority over extent allocation and extent metadata.
pub trait ExtentMap: Send + Sync {
    /// Returns, for each of `volumes` and in the same order, where column
    /// `oid` currently ends.
    fn volume_hwm_info(&self, oid: Oid, volumes: &[VolumeId]) -> BulkLoadResult<Vec<VolumeHwmInfo>>;

    /// Allocates the next extent of column `oid` on `volume`.
    fn create_column_extent(
        &self,
        oid: Oid,
        width: u32,
        volume: VolumeId,
    ) -> BulkLoadResult<AllocatedExtent>;

    /// Starting LBID of the extent holding `block` of a segment file.
    fn extent_start_lbid(
        &self,
        oid: Oid,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        block: u64,
    ) -> BulkLoadResult<Lbid>;

    /// Applies every delta of a finished job at once.
    fn apply_updates(&self, report: &ExtentMapReport) -> BulkLoadResult<()>;
}

/// One extent known to [`MemExtentMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentEntry {
    pub oid: Oid,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
    pub start_block: u64,
    pub blocks: u64,
    pub start_lbid: Lbid,
    /// `None` when the range is unknown or has been invalidated.
    pub cp: Option<(i64, i64)>,
}

type FileKey = (Oid, VolumeId, PartitionId, SegmentId);

#[derive(Default)]
struct MemExtentMapInner {
    /// Extents by starting LBID.
    extents: BTreeMap<Lbid, ExtentEntry>,
    hwms: HashMap<FileKey, Hwm>,
    next_lbid: Lbid,
}

impl MemExtentMapInner {
    fn last_extent_on(&self, oid: Oid, volume: VolumeId) -> Option<&ExtentEntry> {
        self.extents
            .values()
            .filter(|e| e.oid == oid && e.volume == volume)
            .max_by_key(|e| (e.partition, e.segment, e.start_block))
    }

    fn extents_in_file(&self, key: FileKey) -> impl Iterator<Item = &ExtentEntry> {
        self.extents
            .values()
            .filter(move |e| (e.oid, e.volume, e.partition, e.segment) == key)
    }
}

/// In-process [`ExtentMap`].
///
/// Extents of a column on a volume fill segment files in order: a file holds
/// `extents_per_segment_file` extents, then the next segment is used, and after
/// `segments_per_partition` segments the next partition starts at segment 0.
pub struct MemExtentMap {
    extents_per_segment_file: u32,
    segments_per_partition: u16,
    block_size: u64,
    rows_per_extent: u64,
    inner: Mutex<MemExtentMapInner>,
}

impl MemExtentMap {
    pub fn new(options: &BulkLoadOptions) -> Self {
        Self {
            extents_per_segment_file: options.extents_per_segment_file,
            segments_per_partition: options.segments_per_partition,
            block_size: options.block_size as u64,
            rows_per_extent: options.rows_per_extent,
            inner: Mutex::new(MemExtentMapInner::default()),
        }
    }

    /// Overrides the stored HWM of a segment file.
    pub fn set_hwm(
        &self,
        oid: Oid,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        hwm: Hwm,
    ) {
        self.inner
            .lock()
            .hwms
            .insert((oid, volume, partition, segment), hwm);
    }

    pub fn hwm(
        &self,
        oid: Oid,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
    ) -> Option<Hwm> {
        self.inner
            .lock()
            .hwms
            .get(&(oid, volume, partition, segment))
            .copied()
    }

    /// Overrides the stored min/max range of an extent.
    pub fn set_cp(&self, start_lbid: Lbid, cp: Option<(i64, i64)>) -> BulkLoadResult<()> {
        let mut inner = self.inner.lock();
        let extent = inner
            .extents
            .get_mut(&start_lbid)
            .ok_or_else(|| TracedBulkLoadError::not_found("extent", start_lbid))?;
        extent.cp = cp;
        Ok(())
    }

    pub fn extent(&self, start_lbid: Lbid) -> Option<ExtentEntry> {
        self.inner.lock().extents.get(&start_lbid).cloned()
    }

    /// All extents of a column, in LBID order.
    pub fn extents_of(&self, oid: Oid) -> Vec<ExtentEntry> {
        self.inner
            .lock()
            .extents
            .values()
            .filter(|e| e.oid == oid)
            .cloned()
            .collect()
    }

    fn next_file(&self, partition: PartitionId, segment: SegmentId) -> (PartitionId, SegmentId) {
        if segment + 1 >= self.segments_per_partition {
            (partition + 1, 0)
        } else {
            (partition, segment + 1)
        }
    }
}

impl ExtentMap for MemExtentMap {
    fn volume_hwm_info(&self, oid: Oid, volumes: &[VolumeId]) -> BulkLoadResult<Vec<VolumeHwmInfo>> {
        let inner = self.inner.lock();
        let mut infos = Vec::with_capacity(volumes.len());
        for &volume in volumes {
            let Some(last) = inner.last_extent_on(oid, volume) else {
                infos.push(VolumeHwmInfo::empty(volume));
                continue;
            };
            let key = (oid, volume, last.partition, last.segment);
            let local_hwm = inner.hwms.get(&key).copied().unwrap_or(0);
            let start_lbid = inner
                .extents_in_file(key)
                .filter(|e| e.start_block <= local_hwm)
                .max_by_key(|e| e.start_block)
                .map_or(last.start_lbid, |e| e.start_lbid);
            let total_blocks = inner
                .extents
                .values()
                .filter(|e| e.oid == oid && e.volume == volume)
                .map(|e| e.blocks)
                .sum();
            infos.push(VolumeHwmInfo {
                volume,
                partition: last.partition,
                segment: last.segment,
                local_hwm,
                start_lbid,
                total_blocks,
            });
        }
        Ok(infos)
    }

    fn create_column_extent(
        &self,
        oid: Oid,
        width: u32,
        volume: VolumeId,
    ) -> BulkLoadResult<AllocatedExtent> {
        if width == 0 {
            return Err(TracedBulkLoadError::logic("column width must be positive"));
        }
        let blocks = self.rows_per_extent * width as u64 / self.block_size;
        let mut inner = self.inner.lock();
        let (partition, segment, start_block) = match inner.last_extent_on(oid, volume) {
            None => (0, 0, 0),
            Some(last) => {
                let key = (oid, volume, last.partition, last.segment);
                let in_file = inner.extents_in_file(key).count() as u32;
                if in_file < self.extents_per_segment_file {
                    (last.partition, last.segment, last.start_block + last.blocks)
                } else {
                    let (partition, segment) = self.next_file(last.partition, last.segment);
                    (partition, segment, 0)
                }
            }
        };
        let start_lbid = inner.next_lbid;
        inner.next_lbid += blocks as Lbid;
        inner.extents.insert(
            start_lbid,
            ExtentEntry {
                oid,
                volume,
                partition,
                segment,
                start_block,
                blocks,
                start_lbid,
                cp: None,
            },
        );
        inner
            .hwms
            .entry((oid, volume, partition, segment))
            .or_insert(start_block);
        info!(
            oid,
            volume, partition, segment, start_block, start_lbid, "allocated column extent"
        );
        Ok(AllocatedExtent {
            volume,
            partition,
            segment,
            start_lbid,
            start_block,
            blocks,
        })
    }

    fn extent_start_lbid(
        &self,
        oid: Oid,
        volume: VolumeId,
        partition: PartitionId,
        segment: SegmentId,
        block: u64,
    ) -> BulkLoadResult<Lbid> {
        let inner = self.inner.lock();
        let start_lbid = inner
            .extents_in_file((oid, volume, partition, segment))
            .find(|e| e.start_block <= block && block < e.start_block + e.blocks)
            .map(|e| e.start_lbid);
        start_lbid.ok_or_else(|| {
            TracedBulkLoadError::not_found(
                "extent",
                format!("oid {oid} volume {volume} p{partition} s{segment} block {block}"),
            )
        })
    }

    fn apply_updates(&self, report: &ExtentMapReport) -> BulkLoadResult<()> {
        let mut inner = self.inner.lock();
        // validate everything before touching anything
        for column in &report.columns {
            for cp in &column.cp_updates {
                if !inner.extents.contains_key(&cp.start_lbid) {
                    return Err(TracedBulkLoadError::not_found("extent", cp.start_lbid));
                }
            }
        }
        for column in &report.columns {
            if let Some(saved) = column.invalidate {
                if let Some(extent) = inner.extents.get_mut(&saved.start_lbid) {
                    extent.cp = None;
                }
            }
        }
        for column in &report.columns {
            for update in &column.hwm_updates {
                let key = (update.oid, update.volume, update.partition, update.segment);
                let hwm = inner.hwms.entry(key).or_insert(update.hwm);
                *hwm = (*hwm).max(update.hwm);
            }
            for cp in &column.cp_updates {
                let Some(extent) = inner.extents.get_mut(&cp.start_lbid) else {
                    continue;
                };
                extent.cp = if cp.is_new_extent {
                    Some((cp.min, cp.max))
                } else {
                    extent
                        .cp
                        .map(|(min, max)| (min.min(cp.min), max.max(cp.max)))
                };
            }
            debug!(
                column_id = column.column_id,
                hwm_updates = column.hwm_updates.len(),
                cp_updates = column.cp_updates.len(),
                "applied extent map updates"
            );
        }
        Ok(())
    }
}
