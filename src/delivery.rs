//! Delivery engine.
//!
//! Every destination pairs a [`Transport`] with its own queue and a
//! [`worker::DeliveryWorker`] task. The worker wakes on a readiness
//! notification, a periodic tick or an explicit send-now command, takes
//! batches from the queue and reports each outcome back to it.

pub mod http;
pub mod recording;
pub mod retry;
pub mod transport;
pub(crate) mod worker;

pub use http::{classify_status, HttpTransport};
pub use recording::{RecordedSend, RecordingTransport};
pub use retry::RetryPolicy;
pub use transport::{EncodedBatch, Transport, TransportHandle};
