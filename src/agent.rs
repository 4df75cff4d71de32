//! The agent: capture API, context store and lifecycle.
//!
//! [`Agent::builder`] wires a [`ContextStore`], a zone registry and one
//! queue plus delivery worker per destination together. The resulting
//! [`Agent`] is a cheap, cloneable handle.

mod agent;
mod builder;
mod clock;
mod config;
mod context;
mod errors;
pub mod events;
mod panic_hook;
mod scope;

pub use agent::Agent;
pub use builder::AgentBuilder;
pub use clock::{BatchId, Clock, IdSource, ManualClock, SequenceSource, SystemClock};
pub use config::{AgentConfig, LifecyclePhase};
pub use context::{ContextSnapshot, ContextStore};
pub use errors::{AgentError, DeliveryError};
pub use events::{AgentEvent, DropReason};
pub use panic_hook::install_panic_hook;
pub use scope::{ContextGuard, ContextScope};

/// Capacity of the diagnostic broadcast bus and of each worker's command
/// channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
