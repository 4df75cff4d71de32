//! Event buffering for delivery.
//!
//! Every destination owns one [`EventQueue`]. Capture threads append to it,
//! the destination's delivery worker takes [`Batch`]es from it and reports the
//! outcome back. Unsent events can be persisted across restarts with a
//! [`JsonSpillStore`].

pub mod batch;
pub mod queue;
pub mod spill;

pub use batch::Batch;
pub use queue::{EnqueueOutcome, EventQueue, FailOutcome, QueueLimits, QueueStats};
pub use spill::{JsonSpillStore, SpilledEvent};
