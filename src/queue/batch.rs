use std::sync::Arc;
use crate::agent::BatchId;
use crate::event::Event;

/// Events taken off a queue for one transport call, oldest first.
///
/// The queue keeps its own record of the batch until it is acked or failed; a
/// `Batch` is a read-only view handed to the delivery worker.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    events: Vec<Arc<Event>>,
}

impl Batch {
    pub(crate) fn new(id: BatchId, events: Vec<Arc<Event>>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.events.first().map(|e| e.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.events.last().map(|e| e.seq)
    }
}
