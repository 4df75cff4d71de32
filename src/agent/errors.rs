/// Errors raised locally by the agent. None of these ever reach the host as a
/// panic: the public capture operations turn them into `false` plus a
/// diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Zone depth limit of {0} reached")]
    ZoneDepthExceeded(usize),

    #[error("Agent has been shut down")]
    ShutDown,

    #[error("Every destination queue is full")]
    QueueFull,

    #[error("No delivery destinations configured")]
    NoDestinations,

    #[error("Agent must be started from within a Tokio runtime")]
    NotInRuntime,

    #[error("Spill store error: {0}")]
    Spill(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AgentError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AgentError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network trouble, server busy or 5xx. Retried with backoff.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The collector refused the payload. Never re-sent.
    #[error("Payload rejected: {0}")]
    Permanent(String),

    /// The transport did not answer within the send timeout. Retried.
    #[error("Delivery timed out")]
    Timeout,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Permanent(_))
    }
}
