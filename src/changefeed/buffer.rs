//! # Change Buffer
//!
//! Per-feed FIFO of records not yet consumed.
//!
//! Growth is bounded by a soft high-water mark that only warns: the buffer
//! keeps accepting records past it, since dropping would break ordering.

use std::collections::VecDeque;

use super::record::ChangeRecord;

/// Default soft limit before a warning is raised
pub const DEFAULT_SOFT_LIMIT: usize = 1000;

/// Ordered queue of undelivered change records
#[derive(Debug)]
pub struct ChangeBuffer {
    /// Records in server emission order
    records: VecDeque<ChangeRecord>,

    /// High-water mark (0 = never warn)
    soft_limit: usize,

    /// Set once the mark is crossed, re-armed below half of it
    over_limit: bool,
}

impl Default for ChangeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SOFT_LIMIT)
    }
}

impl ChangeBuffer {
    /// Create a buffer with the given soft limit
    pub fn new(soft_limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            soft_limit,
            over_limit: false,
        }
    }

    /// Append a record.
    ///
    /// Returns true when this push crossed the soft limit.
    pub fn push(&mut self, record: ChangeRecord) -> bool {
        self.records.push_back(record);

        if self.soft_limit > 0 && !self.over_limit && self.records.len() > self.soft_limit {
            self.over_limit = true;
            return true;
        }
        false
    }

    /// Remove the oldest record
    pub fn pop(&mut self) -> Option<ChangeRecord> {
        let record = self.records.pop_front();
        if self.over_limit && self.records.len() <= self.soft_limit / 2 {
            self.over_limit = false;
        }
        record
    }

    /// Drop everything, returning how many records were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.records.len();
        self.records.clear();
        self.over_limit = false;
        n
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the soft limit is currently exceeded
    pub fn is_over_limit(&self) -> bool {
        self.over_limit
    }
}
