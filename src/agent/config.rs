use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::delivery::RetryPolicy;

/// Application lifecycle phase. Controls batching aggressiveness and how much
/// the agent logs about itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Release,
    Development,
}

impl Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Release => write!(f, "release"),
            LifecyclePhase::Development => write!(f, "development"),
        }
    }
}

impl TryFrom<u32> for LifecyclePhase {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LifecyclePhase::Release),
            1 => Ok(LifecyclePhase::Development),
            other => Err(other),
        }
    }
}

/// Agent configuration. [`Default`] gives the release profile; use
/// [`AgentConfig::for_phase`] to get the profile matching a lifecycle phase.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on buffered events (pending and in flight) per destination
    pub max_queue_capacity: usize,
    /// Largest number of events sent in one transport call
    pub max_batch_size: usize,
    /// A destination becomes ready once this many events are pending
    pub batch_size_threshold: usize,
    /// ... or once the oldest pending event is this old
    pub batch_time_threshold: Duration,
    /// Period of the delivery worker's readiness check
    pub tick_interval: Duration,
    /// Per transport call
    pub send_timeout: Duration,
    /// Budget for the final flush in [`Agent::shutdown`](crate::Agent::shutdown)
    pub shutdown_timeout: Duration,
    /// Events older than this are dropped instead of sent
    pub max_event_age: Duration,
    pub retry: RetryPolicy,
    /// Deepest zone nesting accepted per execution context
    pub max_zone_depth: usize,
    /// Maximum characters for messages, reasons, metadata values and bridge arguments
    pub max_text_len: usize,
    /// Maximum characters for stack traces
    pub max_stack_len: usize,
    /// Log every captured event at debug level
    pub verbose_diagnostics: bool,
    /// When set, unsent events are written here at shutdown and restored at start
    pub spill_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_queue_capacity: 1000,
            max_batch_size: 50,
            batch_size_threshold: 20,
            batch_time_threshold: Duration::from_secs(30),
            tick_interval: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_event_age: Duration::from_secs(24 * 60 * 60),
            retry: RetryPolicy::default(),
            max_zone_depth: 64,
            max_text_len: 1024,
            max_stack_len: 16 * 1024,
            verbose_diagnostics: false,
            spill_dir: None,
        }
    }
}

impl AgentConfig {
    /// Development sends smaller batches sooner, gives up on retries earlier and
    /// logs every capture.
    pub fn for_phase(phase: LifecyclePhase) -> Self {
        match phase {
            LifecyclePhase::Release => Self::default(),
            LifecyclePhase::Development => Self {
                max_batch_size: 10,
                batch_size_threshold: 5,
                batch_time_threshold: Duration::from_secs(5),
                tick_interval: Duration::from_secs(1),
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(30),
                    jitter: 0.2,
                    max_attempts: 3,
                },
                verbose_diagnostics: true,
                ..Self::default()
            },
        }
    }
}
