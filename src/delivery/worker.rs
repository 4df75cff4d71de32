use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::agent::events::{AgentEvent, DiagnosticBus, DropReason};
use crate::agent::{AgentConfig, Clock, DeliveryError};
use crate::delivery::TransportHandle;
use crate::event::BatchEncoder;
use crate::queue::{Batch, EventQueue, JsonSpillStore};

/// Commands a destination's worker accepts from the agent.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Attempt every currently pending event once, then reply whether every
    /// attempted batch was accepted.
    SendNow { reply: oneshot::Sender<bool> },
}

/// What a worker left behind when it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerReport {
    pub spilled: usize,
    pub lost: usize,
}

/// Everything a worker needs; built by the agent at start.
pub(crate) struct WorkerArgs {
    pub destination: String,
    pub queue: Arc<EventQueue>,
    pub transport: TransportHandle,
    pub encoder: Arc<BatchEncoder>,
    pub clock: Arc<dyn Clock>,
    pub bus: DiagnosticBus,
    pub config: Arc<AgentConfig>,
    pub ready: Arc<Notify>,
    pub cmd_rx: mpsc::Receiver<WorkerCommand>,
    pub cancel: CancellationToken,
    pub spill: Option<JsonSpillStore>,
}

/// Delivery loop for one destination.
///
/// There is exactly one worker per destination and it is the only caller of
/// its transport, so at most one batch is in flight per destination and
/// batches leave in queue order.
pub(crate) struct DeliveryWorker {
    destination: String,
    queue: Arc<EventQueue>,
    transport: TransportHandle,
    encoder: Arc<BatchEncoder>,
    clock: Arc<dyn Clock>,
    bus: DiagnosticBus,
    config: Arc<AgentConfig>,
    ready: Arc<Notify>,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
    spill: Option<JsonSpillStore>,
}

impl DeliveryWorker {
    pub fn new(args: WorkerArgs) -> Self {
        Self {
            destination: args.destination,
            queue: args.queue,
            transport: args.transport,
            encoder: args.encoder,
            clock: args.clock,
            bus: args.bus,
            config: args.config,
            ready: args.ready,
            cmd_rx: args.cmd_rx,
            cancel: args.cancel,
            spill: args.spill,
        }
    }

    pub async fn run(mut self) -> WorkerReport {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::debug!(
            "Delivery worker for '{}' started (transport: {})",
            self.destination,
            self.transport.name()
        );

        let stop = self.cancel.clone();
        let budget = self.config.shutdown_timeout;
        let mut deadline = None;

        while deadline.is_none() {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => {
                    deadline = until_shutdown(&stop, budget, self.handle_command(cmd)).await;
                }
                _ = self.ready.notified() => {
                    deadline = until_shutdown(&stop, budget, self.drain_ready()).await;
                }
                _ = ticker.tick() => {
                    deadline = until_shutdown(&stop, budget, self.drain_ready()).await;
                }
            }
        }

        let deadline = deadline.unwrap_or_else(|| Instant::now() + budget);
        self.finish(deadline).await
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::SendNow { reply } => {
                let ok = self.flush().await;
                let _ = reply.send(ok);
            }
        }
    }

    fn expire(&self) {
        let expired = self.queue.expire(self.clock.now());
        if expired > 0 {
            log::warn!("Dropped {} expired events for '{}'", expired, self.destination);
            self.bus.publish(AgentEvent::EventsDropped {
                destination: self.destination.clone(),
                count: expired,
                reason: DropReason::Expired,
            });
        }
    }

    /// Sends batches while the queue meets a readiness threshold. Stops at the
    /// first transient failure; the requeued events wait out their backoff.
    async fn drain_ready(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            self.expire();
            let now = self.clock.now();
            if !self.queue.is_ready(now) {
                return;
            }
            let Some(batch) = self.queue.next_batch(self.config.max_batch_size, now, false) else {
                return;
            };
            match self.deliver(batch).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => return,
                // the rejected batch is gone, nothing behind it can be reordered
                Err(_) => {}
            }
        }
    }

    /// Attempts every event pending right now at least once, ignoring
    /// thresholds and backoff windows. True when nothing failed.
    ///
    /// A transient failure ends the flush: the requeued events sit at the head
    /// and sending what follows them would break delivery order. Rejected
    /// batches are dropped, so the flush carries on past them.
    async fn flush(&mut self) -> bool {
        self.expire();
        let Some(target) = self.queue.newest_pending_seq() else {
            return true;
        };

        let mut all_ok = true;
        loop {
            let now = self.clock.now();
            let Some(batch) = self.queue.next_batch(self.config.max_batch_size, now, true) else {
                return all_ok;
            };

            let last = batch.last_seq().unwrap_or_default();
            match self.deliver(batch).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => return false,
                Err(_) => all_ok = false,
            }
            if last >= target {
                return all_ok;
            }
        }
    }

    /// One transport call.
    async fn deliver(&mut self, batch: Batch) -> Result<(), DeliveryError> {
        let id = batch.id();

        let outcome = match self.encoder.encode(id, batch.events()) {
            Ok(encoded) => {
                log::trace!(
                    "Sending batch {} to '{}': {} events, seq {}..={}",
                    id,
                    self.destination,
                    encoded.events,
                    encoded.first_seq,
                    encoded.last_seq
                );
                match tokio::time::timeout(self.config.send_timeout, self.transport.send(&encoded)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(DeliveryError::Timeout),
                }
            }
            Err(e) => {
                log::error!("Cannot encode batch {}: {}", id, e);
                Err(DeliveryError::Permanent(e.to_string()))
            }
        };

        match outcome {
            Ok(()) => {
                let events = self.queue.ack(id);
                log::debug!("Batch {} delivered to '{}' ({} events)", id, self.destination, events);
                self.bus.publish(AgentEvent::BatchDelivered {
                    destination: self.destination.clone(),
                    batch_id: id,
                    events,
                });
                Ok(())
            }
            Err(error) => {
                let result = self.queue.fail(id, &error, self.clock.now(), &self.config.retry);
                log::warn!(
                    "Batch {} to '{}' failed: {} ({} requeued, {} dropped)",
                    id,
                    self.destination,
                    error,
                    result.requeued,
                    result.dropped()
                );

                self.bus.publish(AgentEvent::BatchFailed {
                    destination: self.destination.clone(),
                    batch_id: id,
                    error: error.clone(),
                    requeued: result.requeued,
                });
                for (count, reason) in [
                    (result.rejected, DropReason::Rejected),
                    (result.exhausted, DropReason::MaxAttempts),
                    (result.expired, DropReason::Expired),
                ] {
                    if count > 0 {
                        self.bus.publish(AgentEvent::EventsDropped {
                            destination: self.destination.clone(),
                            count,
                            reason,
                        });
                    }
                }
                Err(error)
            }
        }
    }

    /// Final flush until `deadline`, then persist or give up on whatever is
    /// left. A batch still in flight at the deadline is abandoned and counted
    /// as failed.
    async fn finish(mut self, deadline: Instant) -> WorkerReport {
        if tokio::time::timeout_at(deadline, self.flush()).await.is_err() {
            log::warn!(
                "Final flush for '{}' did not finish within the shutdown timeout; abandoning in-flight batch",
                self.destination
            );
        }

        let leftover = self.queue.drain_for_spill();
        if leftover.is_empty() {
            return WorkerReport::default();
        }

        if let Some(store) = &self.spill {
            match store.save(&leftover) {
                Ok(()) => {
                    log::info!(
                        "Spilled {} undelivered events for '{}' to {}",
                        leftover.len(),
                        self.destination,
                        store.path().display()
                    );
                    return WorkerReport {
                        spilled: leftover.len(),
                        lost: 0,
                    };
                }
                Err(e) => log::error!("Cannot spill events for '{}': {}", self.destination, e),
            }
        }

        log::warn!("{} undelivered events for '{}' lost at shutdown", leftover.len(), self.destination);
        self.bus.publish(AgentEvent::EventsDropped {
            destination: self.destination.clone(),
            count: leftover.len(),
            reason: DropReason::Shutdown,
        });
        WorkerReport {
            spilled: 0,
            lost: leftover.len(),
        }
    }
}

/// Runs `work` to completion unless the worker is cancelled meanwhile; from
/// then on `work` only gets until `budget` has elapsed. Returns the shutdown
/// deadline when cancellation happened, `None` otherwise.
async fn until_shutdown(cancel: &CancellationToken, budget: Duration, work: impl Future<Output = ()>) -> Option<Instant> {
    tokio::pin!(work);

    tokio::select! {
        _ = &mut work => return None,
        _ = cancel.cancelled() => {}
    }

    let deadline = Instant::now() + budget;
    if tokio::time::timeout_at(deadline, work).await.is_err() {
        log::warn!("Shutdown timeout elapsed with a delivery in progress; abandoning it");
    }
    Some(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use time::macros::datetime;
    use crate::agent::{LifecyclePhase, ManualClock};
    use crate::delivery::{RecordingTransport, RetryPolicy};
    use crate::event::{BugPayload, Event, EventBody};
    use crate::queue::QueueLimits;

    struct Harness {
        worker: DeliveryWorker,
        queue: Arc<EventQueue>,
        transport: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
        _cmd_tx: mpsc::Sender<WorkerCommand>,
    }

    fn harness(transport: RecordingTransport, config: AgentConfig) -> Harness {
        let queue = Arc::new(EventQueue::new(QueueLimits {
            capacity: config.max_queue_capacity,
            batch_size_threshold: config.batch_size_threshold,
            batch_time_threshold: config.batch_time_threshold,
            max_event_age: config.max_event_age,
        }));
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        let worker = DeliveryWorker::new(WorkerArgs {
            destination: "primary".into(),
            queue: queue.clone(),
            transport: transport.clone(),
            encoder: Arc::new(BatchEncoder::new("acct", LifecyclePhase::Release)),
            clock: clock.clone(),
            bus: DiagnosticBus::default(),
            config: Arc::new(config),
            ready: Arc::new(Notify::new()),
            cmd_rx,
            cancel: CancellationToken::new(),
            spill: None,
        });

        Harness { worker, queue, transport, clock, _cmd_tx: cmd_tx }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            max_batch_size: 3,
            batch_size_threshold: 3,
            retry: RetryPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: 0.0,
                max_attempts: 3,
            },
            ..AgentConfig::default()
        }
    }

    fn fill(h: &Harness, seqs: std::ops::RangeInclusive<u64>) {
        for seq in seqs {
            h.queue.enqueue(
                Arc::new(Event {
                    seq,
                    ts: datetime!(2024-05-01 12:00 UTC),
                    zones: vec![],
                    user_class: None,
                    metadata: BTreeMap::new(),
                    body: EventBody::Bug(BugPayload { message: "x".into() }),
                    truncated: vec![],
                }),
                h.clock.now(),
            );
        }
    }

    #[tokio::test]
    async fn ready_drain_sends_full_batches_only() {
        let mut h = harness(RecordingTransport::new(), config());
        fill(&h, 1..=7);

        h.worker.drain_ready().await;

        // 7 events, threshold 3: two batches of 3, one event left waiting
        assert_eq!(h.transport.accepted_seqs(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(h.queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn flush_ignores_thresholds() {
        let mut h = harness(RecordingTransport::new(), config());
        fill(&h, 1..=4);

        assert!(h.worker.flush().await);
        assert_eq!(h.transport.accepted_seqs(), vec![1, 2, 3, 4]);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn flush_stops_at_first_failure_and_reports_it() {
        let transport = RecordingTransport::with_script([Ok(()), Err(DeliveryError::Transient("502".into()))]);
        let mut h = harness(transport, config());
        fill(&h, 1..=7);

        assert!(!h.worker.flush().await);
        assert_eq!(h.transport.sends().len(), 2);
        assert_eq!(h.queue.stats().pending, 4);
        assert_eq!(h.queue.stats().retried, 3);

        // the retry is held back until its backoff elapses
        h.worker.drain_ready().await;
        assert_eq!(h.transport.sends().len(), 2);

        h.clock.advance(Duration::from_secs(1));
        h.worker.drain_ready().await;
        assert_eq!(h.transport.accepted_seqs(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let transport = RecordingTransport::with_script([Err(DeliveryError::Permanent("400".into()))]);
        let mut h = harness(transport, config());
        fill(&h, 1..=3);

        assert!(!h.worker.flush().await);
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.stats().dropped, 3);

        assert!(h.worker.flush().await);
        assert_eq!(h.transport.sends().len(), 1);
    }

    #[tokio::test]
    async fn flush_continues_past_a_rejected_batch() {
        let transport = RecordingTransport::with_script([Err(DeliveryError::Permanent("400".into()))]);
        let mut h = harness(
            transport,
            AgentConfig {
                max_batch_size: 1,
                ..config()
            },
        );
        fill(&h, 1..=3);

        assert!(!h.worker.flush().await);
        assert_eq!(h.transport.sends().len(), 3);
        assert_eq!(h.transport.accepted_seqs(), vec![2, 3]);
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.stats().dropped, 1);
    }

    #[tokio::test]
    async fn ready_drain_continues_past_a_rejected_batch() {
        let transport = RecordingTransport::with_script([Err(DeliveryError::Permanent("400".into()))]);
        let mut h = harness(transport, config());
        fill(&h, 1..=6);

        h.worker.drain_ready().await;

        assert_eq!(h.transport.sends().len(), 2);
        assert_eq!(h.transport.accepted_seqs(), vec![4, 5, 6]);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let transport = RecordingTransport::with_script(std::iter::repeat(Err(DeliveryError::Timeout)).take(10));
        let mut h = harness(transport, config());
        fill(&h, 1..=1);

        for _ in 0..3 {
            assert!(!h.worker.flush().await);
        }

        assert_eq!(h.transport.sends().len(), 3);
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.stats().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out_as_transient() {
        let transport = RecordingTransport::new().with_delay(Duration::from_secs(30));
        let mut h = harness(
            transport,
            AgentConfig {
                send_timeout: Duration::from_secs(1),
                ..config()
            },
        );
        fill(&h, 1..=1);

        assert!(!h.worker.flush().await);
        assert_eq!(h.queue.stats().retried, 1);
        assert_eq!(h.queue.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_a_send_in_flight_short() {
        let transport = RecordingTransport::new().with_delay(Duration::from_secs(30));
        let h = harness(
            transport,
            AgentConfig {
                send_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_secs(1),
                ..config()
            },
        );
        fill(&h, 1..=1);

        let cancel = h.worker.cancel.clone();
        let cmd_tx = h._cmd_tx.clone();
        let queue = h.queue.clone();
        let worker = tokio::spawn(h.worker.run());

        let (reply, answer) = oneshot::channel();
        cmd_tx.send(WorkerCommand::SendNow { reply }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.stats().in_flight, 1);

        let started = Instant::now();
        cancel.cancel();
        let report = worker.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report, WorkerReport { spilled: 0, lost: 1 });
        assert!(answer.await.is_err());
    }
}
