//! In-process diagnostics agent.
//!
//! Applications place markers, report bugs and exceptions, and describe what
//! they are doing with nestable *zones*. Every captured [`Event`] is stamped
//! with the active zones and a copy of the diagnostic context, buffered in a
//! bounded queue per destination and delivered in batches with retry and
//! backoff.
//!
//! ```no_run
//! # async fn demo() -> Result<(), zonetrace::AgentError> {
//! use zonetrace::{Agent, HttpTransport, LifecyclePhase};
//!
//! let agent = Agent::builder("acct-1", LifecyclePhase::Development)
//!     .destination("collector", HttpTransport::new("https://collector.example/v1/events")?)
//!     .start()?;
//!
//! agent.set_user_class("beta");
//! agent.start_zone("checkout");
//! agent.report_bug("card declined");
//! agent.stop_zone();
//!
//! agent.send_now().await;
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod delivery;
pub mod event;
pub mod queue;
pub mod zone;

pub use agent::*;
pub use delivery::{HttpTransport, RecordingTransport, RetryPolicy, Transport};
pub use event::{CallSite, Event, EventKind, JsAction};
pub use zone::ExecutionId;
