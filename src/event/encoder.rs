use std::sync::Arc;
use serde::Serialize;
use crate::agent::{AgentError, BatchId, LifecyclePhase};
use crate::delivery::EncodedBatch;
use crate::event::Event;

/// Batch envelope as it goes over the wire.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireBatch<'a> {
    account_id: &'a str,
    phase: LifecyclePhase,
    events: Vec<&'a Event>,
}

/// Turns batches into the JSON payload handed to transports.
///
/// Output depends only on the account, the phase and the events themselves,
/// so re-encoding a batch for a retry produces the same bytes.
#[derive(Debug, Clone)]
pub struct BatchEncoder {
    account_id: String,
    phase: LifecyclePhase,
}

impl BatchEncoder {
    pub fn new(account_id: impl Into<String>, phase: LifecyclePhase) -> Self {
        Self {
            account_id: account_id.into(),
            phase,
        }
    }

    pub fn encode_event(event: &Event) -> Result<Vec<u8>, AgentError> {
        Ok(serde_json::to_vec(event)?)
    }

    pub fn encode(&self, id: BatchId, events: &[Arc<Event>]) -> Result<EncodedBatch, AgentError> {
        let wire = WireBatch {
            account_id: &self.account_id,
            phase: self.phase,
            events: events.iter().map(|e| e.as_ref()).collect(),
        };

        Ok(EncodedBatch {
            id,
            body: serde_json::to_vec(&wire)?,
            events: events.len(),
            first_seq: events.first().map(|e| e.seq).unwrap_or_default(),
            last_seq: events.last().map(|e| e.seq).unwrap_or_default(),
        })
    }
}
