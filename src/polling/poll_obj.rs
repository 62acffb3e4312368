//! The cache entity for one polled command or attribute.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::ring::{RingBuffer, RingEntry};
use crate::data::{now_ms, AttributeValue, CmdValue};
use crate::error::DevError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollObjKind {
    Command,
    Attribute,
}

impl fmt::Display for PollObjKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollObjKind::Command => write!(f, "command"),
            PollObjKind::Attribute => write!(f, "attribute"),
        }
    }
}

/// A value stored in a polling buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum PolledData {
    Command(CmdValue),
    Attribute(AttributeValue),
}

/// Lock-protected part of a [`PolledObject`].
#[derive(Debug)]
pub struct PollObjInner {
    upd: Duration,
    poll_old_factor: u32,
    pub ring: RingBuffer<PolledData>,
}

impl PollObjInner {
    pub fn upd(&self) -> Duration {
        self.upd
    }

    /// Maximum tolerated age of the latest entry.
    pub fn authorized_delta(&self) -> Duration {
        self.upd * self.poll_old_factor
    }

    /// Whether the latest entry is too old to be served from the cache.
    /// Externally triggered objects never go stale, and neither does an
    /// empty ring (that case is reported as "no data" instead).
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.upd.is_zero() {
            return false;
        }
        match self.ring.last_insert() {
            Some(last) => now.saturating_duration_since(last) > self.authorized_delta(),
            None => false,
        }
    }

    pub fn push(&mut self, value: Result<PolledData, DevError>, when: Instant, needed: Duration) {
        self.ring.push(RingEntry {
            when,
            date_ms: now_ms(),
            needed,
            value,
        });
    }
}

/// One polled (device, kind, name) triple with its history buffer.
///
/// The name is lower-cased once here and every lookup compares against it.
#[derive(Debug)]
pub struct PolledObject {
    device: String,
    kind: PollObjKind,
    name: String,
    inner: Mutex<PollObjInner>,
}

impl PolledObject {
    pub fn new(
        device: &str,
        kind: PollObjKind,
        name: &str,
        upd: Duration,
        depth: usize,
        poll_old_factor: u32,
    ) -> Self {
        Self {
            device: device.to_lowercase(),
            kind,
            name: name.to_lowercase(),
            inner: Mutex::new(PollObjInner {
                upd,
                poll_old_factor: poll_old_factor.max(1),
                ring: RingBuffer::new(depth),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn kind(&self) -> PollObjKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, kind: PollObjKind, name: &str) -> bool {
        self.kind == kind && self.name.eq_ignore_ascii_case(name)
    }

    /// Take the per-object lock. Never hold it across a live execution.
    pub fn lock(&self) -> MutexGuard<'_, PollObjInner> {
        self.inner.lock()
    }

    pub fn upd(&self) -> Duration {
        self.inner.lock().upd
    }

    pub fn update_upd(&self, upd: Duration) {
        self.inner.lock().upd = upd;
    }

    pub fn is_ring_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.inner.lock().is_stale(now)
    }

    pub fn insert(&self, value: Result<PolledData, DevError>, when: Instant, needed: Duration) {
        self.inner.lock().push(value, when, needed);
    }

    /// Insert a record produced outside the polling engine and dated by the
    /// caller. Its needed time is zero.
    pub fn insert_external(&self, value: Result<PolledData, DevError>, date_ms: u64) {
        let age = Duration::from_millis(now_ms().saturating_sub(date_ms));
        let now = Instant::now();
        let when = now.checked_sub(age).unwrap_or(now);
        self.inner.lock().ring.push(RingEntry {
            when,
            date_ms,
            needed: Duration::ZERO,
            value,
        });
    }
}
