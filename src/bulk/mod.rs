// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Write path of a bulk load job.
//!
//! A [`TableLoader`] owns one [`ColumnLoader`] per column. Each column decides
//! where its rows go through a [`VolumeExtentTracker`], allocates extents from
//! the shared [`ExtentMap`], fills them through a [`SegmentFileBackend`] and
//! tracks per-extent min/max with a [`CpTracker`]. Every extent-map change is
//! collected into one [`ExtentMapReport`] that is applied when the job ends.

mod auto_inc;
mod column;
mod cp;
mod dictionary;
mod error;
mod extent_map;
mod extent_tracker;
mod options;
mod report;
mod segment_file;
mod status;
mod table;

pub use self::auto_inc::*;
pub use self::column::*;
pub use self::cp::*;
pub use self::dictionary::*;
pub use self::error::*;
pub use self::extent_map::*;
pub use self::extent_tracker::*;
pub use self::options::*;
pub use self::report::*;
pub use self::segment_file::*;
pub use self::status::*;
pub use self::table::*;

#[cfg(test)]
mod tests;
