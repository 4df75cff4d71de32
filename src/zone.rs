//! Zone tracking: [`ZoneRegistry`], [`ZoneStack`] and [`ExecutionId`].
//!
//! A zone is a caller-defined, nestable span of execution ("checkout",
//! "checkout → paymentValidation"). Every captured event is tagged with the
//! zones active in the context that captured it.

pub mod execution;
pub mod registry;
pub mod stack;

pub use execution::ExecutionId;
pub use registry::{ZoneOutcome, ZoneRegistry};
pub use stack::{ClosedZone, ZoneStack};
