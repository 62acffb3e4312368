//! Fixed-capacity history of polled results.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{DevError, DsError};

/// One record of the polling history.
#[derive(Clone, Debug)]
pub struct RingEntry<T> {
    /// Monotonic insertion time, used for staleness checks.
    pub when: Instant,
    /// Wall-clock insertion time in milliseconds since the epoch.
    pub date_ms: u64,
    /// Time it took to produce the value. Zero for externally filled entries.
    pub needed: Duration,
    pub value: Result<T, DevError>,
}

impl<T> RingEntry<T> {
    pub fn is_error(&self) -> bool {
        self.value.is_err()
    }
}

/// A circular buffer of polling results.
///
/// Callers are expected to hold the owning polled object's lock, so none of
/// these methods block.
#[derive(Debug)]
pub struct RingBuffer<T> {
    depth: usize,
    entries: VecDeque<RingEntry<T>>,
}

impl<T> RingBuffer<T> {
    /// Create an empty ring. A depth of zero is bumped to one.
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new record, overwriting the oldest one when full.
    pub fn push(&mut self, entry: RingEntry<T>) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The most recent record.
    pub fn latest(&self) -> Result<&RingEntry<T>, DsError> {
        self.entries
            .back()
            .ok_or_else(|| DsError::NoDataYet("No data available in the polling buffer".to_string()))
    }

    /// Up to `n` records, most recent first.
    pub fn history(&self, n: usize) -> Result<Vec<&RingEntry<T>>, DsError> {
        if self.entries.is_empty() {
            return Err(DsError::NoDataYet(
                "No data available in the polling buffer".to_string(),
            ));
        }
        Ok(self.entries.iter().rev().take(n).collect())
    }

    /// Time elapsed between each of the last `n` consecutive records, most
    /// recent first. Needs at least two records.
    pub fn delta_t(&self, n: usize) -> Result<Vec<Duration>, DsError> {
        if self.entries.len() < 2 {
            return Err(DsError::NoDataYet(
                "Not enough data in the polling buffer to compute delta".to_string(),
            ));
        }
        let newest_first: Vec<Instant> = self
            .entries
            .iter()
            .rev()
            .take(n.max(2))
            .map(|e| e.when)
            .collect();
        Ok(newest_first
            .windows(2)
            .map(|w| w[0].saturating_duration_since(w[1]))
            .collect())
    }

    pub fn last_insert(&self) -> Option<Instant> {
        self.entries.back().map(|e| e.when)
    }

    pub fn needed_time(&self) -> Option<Duration> {
        self.entries.back().map(|e| e.needed)
    }

    pub fn is_last_an_error(&self) -> bool {
        self.entries.back().map(RingEntry::is_error).unwrap_or(false)
    }

    /// The failure stored in the most recent record, if that record failed.
    pub fn last_error(&self) -> Option<&DevError> {
        self.entries.back().and_then(|e| e.value.as_ref().err())
    }
}
