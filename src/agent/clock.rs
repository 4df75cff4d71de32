//! Time and identifier sources used when stamping events.
//!
//! The agent never reads the system clock or mints sequence numbers directly;
//! it goes through [`Clock`] and [`IdSource`] so hosts and tests can inject
//! their own.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Source of wall-clock timestamps (for the wire) and monotonic instants
/// (for batching age, backoff and zone durations).
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
    fn now(&self) -> Instant;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Both readings advance together.
#[derive(Debug)]
pub struct ManualClock {
    base_utc: OffsetDateTime,
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base_utc: OffsetDateTime) -> Self {
        Self {
            base_utc,
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        self.base_utc + self.offset()
    }

    fn now(&self) -> Instant {
        self.base + self.offset()
    }
}

/// Source of process-scoped, monotonically increasing event sequence numbers.
pub trait IdSource: Send + Sync {
    /// Returns the next sequence number. Never returns the same value twice.
    fn next_seq(&self) -> u64;

    /// Makes sure every future sequence number is greater than `seq`. Used when
    /// events from a previous run are restored.
    fn advance_past(&self, seq: u64);
}

/// Atomic counter starting at 1.
#[derive(Debug)]
pub struct SequenceSource {
    next: AtomicU64,
}

impl Default for SequenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceSource {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl IdSource for SequenceSource {
    fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn advance_past(&self, seq: u64) {
        self.next.fetch_max(seq.saturating_add(1), Ordering::Relaxed);
    }
}

/// A unique identifier for a batch handed to a transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
