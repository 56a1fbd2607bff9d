// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use tracing::info;

use super::{BulkLoadResult, TracedBulkLoadError};

/// Hands out auto-increment values of one column in contiguous ranges.
#[derive(Debug)]
pub struct AutoIncrement {
    column: String,
    max_value: u64,
    table: Option<String>,
    /// Next value to hand out; `None` until initialized from the catalog.
    next_value: Option<u64>,
}

impl AutoIncrement {
    pub fn new(column: impl Into<String>, max_value: u64) -> Self {
        Self {
            column: column.into(),
            max_value,
            table: None,
            next_value: None,
        }
    }

    /// Starts from the next value stored in the catalog for `table`.
    pub fn init(&mut self, table: &str, next_value: u64) -> BulkLoadResult<()> {
        if next_value == 0 || next_value > self.max_value {
            return Err(TracedBulkLoadError::auto_increment(format!(
                "next value {next_value} of {table}.{} is out of range",
                self.column
            )));
        }
        self.table = Some(table.to_string());
        self.next_value = Some(next_value);
        Ok(())
    }

    /// Reserves `count` consecutive values and returns the first one.
    pub fn reserve(&mut self, count: u64) -> BulkLoadResult<u64> {
        let next = self.next_value.ok_or_else(|| {
            TracedBulkLoadError::auto_increment(format!(
                "auto-increment of column {} is not initialized",
                self.column
            ))
        })?;
        let last = next
            .checked_add(count.saturating_sub(1))
            .filter(|last| *last <= self.max_value)
            .ok_or_else(|| {
                TracedBulkLoadError::auto_increment(format!(
                    "reserving {count} values from {next} exceeds the maximum {} of column {}",
                    self.max_value, self.column
                ))
            })?;
        self.next_value = Some(last + 1).filter(|_| count > 0).or(Some(next));
        Ok(next)
    }

    /// Returns the next value to store back into the catalog.
    pub fn finish(&mut self) -> BulkLoadResult<u64> {
        let next = self.next_value.ok_or_else(|| {
            TracedBulkLoadError::auto_increment(format!(
                "auto-increment of column {} is not initialized",
                self.column
            ))
        })?;
        info!(
            table = self.table.as_deref().unwrap_or_default(),
            column = %self.column,
            next,
            "finished auto-increment"
        );
        Ok(next)
    }

    pub fn next_value(&self) -> Option<u64> {
        self.next_value
    }
}
