//! Event model and wire encoding.
//!
//! - [`Event`], [`EventBody`] and the per-kind payloads: what gets captured.
//! - [`BatchEncoder`]: deterministic JSON encoding of batches.
//! - [`TextLimiter`]: bounds text fields and records truncation.
//! - [`JsRequest`]: typed decoding of JavaScript bridge calls.

pub mod bridge;
pub mod encoder;
pub mod model;
pub mod truncate;

pub use bridge::{JsAction, JsRequest};
pub use encoder::BatchEncoder;
pub use model::{
    BugPayload, CallSite, Event, EventBody, EventKind, ExceptionPayload, JsBridgePayload,
    MarkerPayload, Truncation, ZoneStartPayload, ZoneStopPayload,
};
pub use truncate::TextLimiter;
