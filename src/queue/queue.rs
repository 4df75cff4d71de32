//! Bounded event queue with batching.
//!
//! Each event moves through `Pending → InFlight → Acked` (removed), or
//! `InFlight → Failed → Pending` with its attempt counter bumped and a backoff
//! deadline, or ends up `Dropped` (overflow, expiry, exhausted retries or a
//! permanent rejection).
//!
//! ### Concurrency
//! All state sits behind one `Mutex`; every operation is a short, non-awaiting
//! critical section so capture threads never wait on delivery. A batch moves
//! its events out of `pending` atomically, so two callers of
//! [`EventQueue::next_batch`] can never receive the same event.
//!
//! ### Ordering
//! `pending` is FIFO. Failed events go back to the *front*, and a batch never
//! skips over an event that is still inside its backoff window, so events
//! leave in the order they became pending.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use crate::agent::{BatchId, DeliveryError};
use crate::delivery::RetryPolicy;
use crate::event::Event;
use crate::queue::{Batch, SpilledEvent};

/// Size and batching limits for one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueLimits {
    pub capacity: usize,
    pub batch_size_threshold: usize,
    pub batch_time_threshold: Duration,
    pub max_event_age: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size_threshold: 20,
            batch_time_threshold: Duration::from_secs(30),
            max_event_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Counters and gauges for one queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub acked: u64,
    /// Dropped because the queue was full
    pub evicted: u64,
    /// Dropped after exhausting retries, expiring or being rejected
    pub dropped: u64,
    /// Returned to pending after a transient failure
    pub retried: u64,
}

/// Result of [`EventQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// False when the queue was full of in-flight events and the new event
    /// itself had to be dropped.
    pub accepted: bool,
    /// Events dropped to make room (0 or 1)
    pub evicted: usize,
    /// The queue now meets a batching threshold
    pub ready: bool,
}

/// Result of [`EventQueue::fail`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    pub requeued: usize,
    /// Reached `max_attempts`
    pub exhausted: usize,
    /// Exceeded `max_event_age`
    pub expired: usize,
    /// Permanently rejected by the collector
    pub rejected: usize,
}

impl FailOutcome {
    pub fn dropped(&self) -> usize {
        self.exhausted + self.expired + self.rejected
    }
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: Arc<Event>,
    /// Failed delivery attempts so far
    attempts: u32,
    enqueued_at: Instant,
    /// Backoff deadline; `None` for events that never failed
    not_before: Option<Instant>,
}

impl QueuedEvent {
    fn is_eligible(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<QueuedEvent>,
    in_flight: HashMap<BatchId, Vec<QueuedEvent>>,
    in_flight_count: usize,
    stats: QueueStats,
}

impl QueueInner {
    fn buffered(&self) -> usize {
        self.pending.len() + self.in_flight_count
    }

    fn take_in_flight(&mut self, id: BatchId) -> Option<Vec<QueuedEvent>> {
        let entries = self.in_flight.remove(&id)?;
        self.in_flight_count -= entries.len();
        Some(entries)
    }
}

/// A bounded, thread-safe queue of events awaiting delivery to one destination.
#[derive(Debug)]
pub struct EventQueue {
    limits: QueueLimits,
    inner: Mutex<QueueInner>,
}

impl EventQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits: QueueLimits {
                capacity: limits.capacity.max(1),
                ..limits
            },
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event. When the queue is full the oldest pending event is
    /// evicted; in-flight events are never evicted.
    pub fn enqueue(&self, event: Arc<Event>, now: Instant) -> EnqueueOutcome {
        let mut inner = self.inner();
        let mut evicted = 0;

        if inner.buffered() >= self.limits.capacity {
            inner.stats.evicted += 1;
            evicted = 1;
            if inner.pending.pop_front().is_none() {
                return EnqueueOutcome {
                    accepted: false,
                    evicted,
                    ready: false,
                };
            }
        }

        inner.pending.push_back(QueuedEvent {
            event,
            attempts: 0,
            enqueued_at: now,
            not_before: None,
        });
        inner.stats.enqueued += 1;

        EnqueueOutcome {
            accepted: true,
            evicted,
            ready: self.is_ready_locked(&inner, now),
        }
    }

    /// Whether a batch should be sent now: enough events are pending, the oldest
    /// one has waited long enough, or a retried event's backoff has elapsed.
    pub fn is_ready(&self, now: Instant) -> bool {
        let inner = self.inner();
        self.is_ready_locked(&inner, now)
    }

    fn is_ready_locked(&self, inner: &QueueInner, now: Instant) -> bool {
        let Some(head) = inner.pending.front() else {
            return false;
        };
        if !head.is_eligible(now) {
            return false;
        }

        head.not_before.is_some()
            || inner.pending.len() >= self.limits.batch_size_threshold.max(1)
            || now.saturating_duration_since(head.enqueued_at) >= self.limits.batch_time_threshold
    }

    /// Moves up to `max` pending events, oldest first, into a new in-flight
    /// batch. Stops at the first event still inside its backoff window unless
    /// `force` is set. Returns `None` when nothing could be taken.
    pub fn next_batch(&self, max: usize, now: Instant, force: bool) -> Option<Batch> {
        let mut inner = self.inner();
        let mut taken = Vec::new();

        while taken.len() < max.max(1) {
            match inner.pending.front() {
                Some(head) if force || head.is_eligible(now) => {
                    if let Some(entry) = inner.pending.pop_front() {
                        taken.push(entry);
                    }
                }
                _ => break,
            }
        }

        if taken.is_empty() {
            return None;
        }

        let id = BatchId::new();
        let events = taken.iter().map(|e| e.event.clone()).collect();
        inner.in_flight_count += taken.len();
        inner.in_flight.insert(id, taken);

        Some(Batch::new(id, events))
    }

    /// Drops pending events older than `max_event_age`. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let mut inner = self.inner();
        let max_age = self.limits.max_event_age;
        let before = inner.pending.len();

        inner
            .pending
            .retain(|e| now.saturating_duration_since(e.enqueued_at) < max_age);

        let expired = before - inner.pending.len();
        inner.stats.dropped += expired as u64;
        expired
    }

    /// The collector accepted the batch. Returns the number of events removed.
    pub fn ack(&self, id: BatchId) -> usize {
        let mut inner = self.inner();
        let Some(entries) = inner.take_in_flight(id) else {
            return 0;
        };

        inner.stats.acked += entries.len() as u64;
        entries.len()
    }

    /// The batch failed. Transient failures requeue each event at the front
    /// with its attempt counter bumped and a backoff deadline from `policy`,
    /// unless it ran out of attempts or grew too old. Permanent failures drop
    /// the whole batch.
    pub fn fail(&self, id: BatchId, error: &DeliveryError, now: Instant, policy: &RetryPolicy) -> FailOutcome {
        let mut inner = self.inner();
        let mut outcome = FailOutcome::default();

        let Some(entries) = inner.take_in_flight(id) else {
            return outcome;
        };

        if !error.is_transient() {
            outcome.rejected = entries.len();
            inner.stats.dropped += entries.len() as u64;
            return outcome;
        }

        let mut retry = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let failed_attempt = entry.attempts;
            entry.attempts += 1;

            if policy.is_exhausted(entry.attempts) {
                outcome.exhausted += 1;
            } else if now.saturating_duration_since(entry.enqueued_at) >= self.limits.max_event_age {
                outcome.expired += 1;
            } else {
                entry.not_before = Some(now + policy.delay_for_attempt(failed_attempt));
                retry.push(entry);
            }
        }

        outcome.requeued = retry.len();
        inner.stats.retried += retry.len() as u64;
        inner.stats.dropped += (outcome.exhausted + outcome.expired) as u64;
        for entry in retry.into_iter().rev() {
            inner.pending.push_front(entry);
        }

        outcome
    }

    /// Sequence number of the newest pending event.
    pub fn newest_pending_seq(&self) -> Option<u64> {
        self.inner().pending.iter().map(|e| e.event.seq).max()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner();
        QueueStats {
            pending: inner.pending.len(),
            in_flight: inner.in_flight_count,
            ..inner.stats
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner().buffered() == 0
    }

    /// Empties the queue for persistence. In-flight events count as failed, so
    /// their attempt counter is bumped. Result is in sequence order.
    pub fn drain_for_spill(&self) -> Vec<SpilledEvent> {
        let mut inner = self.inner();
        let mut drained: Vec<SpilledEvent> = Vec::with_capacity(inner.buffered());

        for (_, entries) in inner.in_flight.drain() {
            drained.extend(entries.into_iter().map(|e| SpilledEvent {
                attempts: e.attempts + 1,
                event: (*e.event).clone(),
            }));
        }
        inner.in_flight_count = 0;

        drained.extend(inner.pending.drain(..).map(|e| SpilledEvent {
            attempts: e.attempts,
            event: (*e.event).clone(),
        }));

        drained.sort_by_key(|e| e.event.seq);
        drained
    }

    /// Puts events from a previous run back as pending, ahead of anything
    /// enqueued since. Events that already exhausted `policy` or outlived
    /// `max_event_age` (measured from their capture timestamp against
    /// `now_utc`) are dropped. Returns the number restored.
    pub fn restore(
        &self,
        mut events: Vec<SpilledEvent>,
        now: Instant,
        now_utc: OffsetDateTime,
        policy: &RetryPolicy,
    ) -> usize {
        let mut inner = self.inner();
        events.sort_by_key(|e| e.event.seq);

        let max_age = self.limits.max_event_age;
        let age_of = |e: &SpilledEvent| Duration::try_from(now_utc - e.event.ts).unwrap_or(Duration::ZERO);

        let before = events.len();
        events.retain(|e| !policy.is_exhausted(e.attempts) && age_of(e) < max_age);
        inner.stats.dropped += (before - events.len()) as u64;

        let room = self.limits.capacity.saturating_sub(inner.buffered());
        if events.len() > room {
            let overflow = events.len() - room;
            events.drain(..overflow);
            inner.stats.evicted += overflow as u64;
        }

        let restored = events.len();
        for spilled in events.into_iter().rev() {
            // keep the age the event already has so expiry still applies
            let enqueued_at = now.checked_sub(age_of(&spilled)).unwrap_or(now);
            inner.pending.push_front(QueuedEvent {
                event: Arc::new(spilled.event),
                attempts: spilled.attempts,
                enqueued_at,
                not_before: None,
            });
        }

        restored
    }
}
