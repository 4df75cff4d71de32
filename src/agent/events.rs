//! Diagnostic events emitted by the agent.
//!
//! Nothing the agent does internally ever surfaces as an error to the host;
//! instead every notable state transition (overflow, drops, unbalanced zones,
//! delivery outcomes) is published as an [`AgentEvent`] on a broadcast bus
//! and mirrored to the `log` facade.

use tokio::sync::broadcast;
use crate::agent::{BatchId, DeliveryError, LifecyclePhase, DEFAULT_CHANNEL_CAPACITY};
use crate::zone::ExecutionId;

/// Why events left a queue without being delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Queue capacity exceeded
    Overflow,
    /// Collector rejected the payload
    Rejected,
    /// Retries exhausted
    MaxAttempts,
    /// Older than the maximum event age
    Expired,
    /// Still buffered at shutdown with no spill store configured
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    // ****************************************
    // ** Agent lifecycle
    /// Agent has started
    AgentStarted { phase: LifecyclePhase },
    /// Agent finished shutting down
    AgentShutdown { spilled: usize, lost: usize },
    /// Events from a previous run were put back into a queue
    EventsRestored { destination: String, count: usize },

    // ****************************************
    // ** Capture
    /// A capture call was refused before anything was queued
    CaptureRejected { reason: String },
    /// `stop_zone` was called with no open zone
    UnbalancedZone { context: ExecutionId },
    /// `start_zone` would exceed the configured depth
    ZoneDepthExceeded { context: ExecutionId, zone: String },
    /// A zone was still open when its context ended
    ZoneAutoClosed { context: ExecutionId, zone: String },

    // ****************************************
    // ** Delivery
    /// The collector accepted a batch
    BatchDelivered { destination: String, batch_id: BatchId, events: usize },
    /// A transport call failed; `requeued` events will be retried
    BatchFailed { destination: String, batch_id: BatchId, error: DeliveryError, requeued: usize },
    /// Events were dropped
    EventsDropped { destination: String, count: usize, reason: DropReason },
}

/// Broadcast bus for [`AgentEvent`]s.
#[derive(Debug, Clone)]
pub(crate) struct DiagnosticBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for DiagnosticBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl DiagnosticBus {
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, ev: AgentEvent) {
        // Only fails when nobody is subscribed, which is fine.
        let _ = self.tx.send(ev);
    }
}
