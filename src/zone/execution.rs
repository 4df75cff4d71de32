use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

/// Identifies the execution context (thread, task or caller-chosen handle) that
/// owns a zone stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(u64);

impl ExecutionId {
    /// The current Tokio task when called from inside one, otherwise the current
    /// OS thread.
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(task) => Self::hashed(("task", task)),
            None => Self::current_thread(),
        }
    }

    /// The current OS thread, even when running inside a Tokio task.
    pub fn current_thread() -> Self {
        Self::hashed(("thread", std::thread::current().id()))
    }

    fn hashed(value: impl Hash) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ExecutionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{:016x}", self.0)
    }
}
