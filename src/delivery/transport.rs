use std::sync::Arc;
use futures::future::BoxFuture;
use crate::agent::{BatchId, DeliveryError};

/// A batch in its wire form, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub id: BatchId,
    /// JSON body
    pub body: Vec<u8>,
    pub events: usize,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// The network boundary. Implementations send one batch and say whether the
/// collector took it.
///
/// The agent wraps every call in its own send timeout, so implementations do
/// not need one; an elapsed timeout is treated as
/// [`DeliveryError::Timeout`].
pub trait Transport: Send + Sync {
    /// Name of the transport (used in logs)
    fn name(&self) -> &str;

    fn send<'a>(&'a self, batch: &'a EncodedBatch) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

pub type TransportHandle = Arc<dyn Transport>;
