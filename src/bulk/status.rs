// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

use serde::Serialize;

/// Progress of a table (or of one of its read buffers) through a load job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[default]
    New,
    ReadInProgress,
    ReadComplete,
    ParseComplete,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::ReadInProgress => "READ_PROGRESS",
            Self::ReadComplete => "READ_COMPLETE",
            Self::ParseComplete => "PARSE_COMPLETE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Which worker currently owns a unit of work, and how far it got.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub locker: Option<usize>,
    pub status: Status,
}

impl LockInfo {
    pub fn acquire(&mut self, worker: usize) -> bool {
        match self.locker {
            Some(owner) if owner != worker => false,
            _ => {
                self.locker = Some(worker);
                true
            }
        }
    }

    pub fn release(&mut self, status: Status) {
        self.locker = None;
        self.status = status;
    }
}

/// Lifecycle of one column within a job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    #[default]
    New,
    Loading,
    Closed,
    Error,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
