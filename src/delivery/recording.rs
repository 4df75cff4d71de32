use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use crate::agent::DeliveryError;
use crate::delivery::{EncodedBatch, Transport};

/// One call seen by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSend {
    pub batch: EncodedBatch,
    pub outcome: Result<(), DeliveryError>,
}

impl RecordedSend {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.batch.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    script: VecDeque<Result<(), DeliveryError>>,
    sends: Vec<RecordedSend>,
    delay: Option<Duration>,
}

/// In-process transport that records every batch and answers from a script.
///
/// Once the script runs out every send succeeds. Useful for hosts that want
/// to test their instrumentation and as the agent's own test double.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    state: Mutex<RecordingState>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers the next sends with `outcomes`, in order.
    pub fn with_script(outcomes: impl IntoIterator<Item = Result<(), DeliveryError>>) -> Self {
        let transport = Self::new();
        transport.state().script.extend(outcomes);
        transport
    }

    /// Makes every send take `delay` before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = Some(delay);
        self
    }

    pub fn push_outcome(&self, outcome: Result<(), DeliveryError>) {
        self.state().script.push_back(outcome);
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every attempt, successful or not.
    pub fn sends(&self) -> Vec<RecordedSend> {
        self.state().sends.clone()
    }

    /// Batches the transport accepted.
    pub fn accepted(&self) -> Vec<RecordedSend> {
        self.state()
            .sends
            .iter()
            .filter(|s| s.outcome.is_ok())
            .cloned()
            .collect()
    }

    /// Sequence numbers of every accepted event, in delivery order.
    pub fn accepted_seqs(&self) -> Vec<u64> {
        self.accepted()
            .iter()
            .flat_map(|send| {
                send.json()["events"]
                    .as_array()
                    .map(|events| events.iter().filter_map(|e| e["seq"].as_u64()).collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn send<'a>(&'a self, batch: &'a EncodedBatch) -> BoxFuture<'a, Result<(), DeliveryError>> {
        async move {
            let delay = self.state().delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state();
            let outcome = state.script.pop_front().unwrap_or(Ok(()));
            state.sends.push(RecordedSend {
                batch: batch.clone(),
                outcome: outcome.clone(),
            });
            outcome
        }
        .boxed()
    }
}
