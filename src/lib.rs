// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

#![feature(error_generic_member_access)]
#![deny(unused_must_use)]

pub mod bulk;
pub mod catalog;
pub mod types;

pub use self::bulk::{BulkLoadError, BulkLoadOptions, BulkLoadResult, TableLoader};
