use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use crate::agent::AgentError;
use crate::zone::{ClosedZone, ExecutionId, ZoneStack};

/// Result of [`ZoneRegistry::stop_zone`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneOutcome {
    Stopped(ClosedZone),
    /// Stop was called with no active zone. Reported, never fatal.
    Unbalanced,
}

/// Owns one [`ZoneStack`] per execution context.
///
/// Stacks are created on the first `start_zone` for a context and removed once
/// they are empty again or the context ends, so short-lived threads do not
/// leave entries behind.
#[derive(Debug)]
pub struct ZoneRegistry {
    max_depth: usize,
    stacks: Mutex<HashMap<ExecutionId, ZoneStack>>,
}

impl ZoneRegistry {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            stacks: Mutex::new(HashMap::new()),
        }
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<ExecutionId, ZoneStack>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes `name` onto `ctx`'s stack and returns the resulting snapshot
    /// (which ends with `name`).
    pub fn start_zone(&self, ctx: ExecutionId, name: &str, now: Instant) -> Result<Vec<String>, AgentError> {
        if name.trim().is_empty() {
            return Err(AgentError::validation("zone name", "must not be empty"));
        }

        let mut stacks = self.stacks();
        let stack = stacks.entry(ctx).or_default();
        if stack.depth() >= self.max_depth {
            return Err(AgentError::ZoneDepthExceeded(self.max_depth));
        }

        stack.push(name, now);
        Ok(stack.snapshot())
    }

    pub fn stop_zone(&self, ctx: ExecutionId, now: Instant) -> ZoneOutcome {
        let mut stacks = self.stacks();
        let Some(stack) = stacks.get_mut(&ctx) else {
            return ZoneOutcome::Unbalanced;
        };

        let closed = stack.pop(now);
        if stack.is_empty() {
            stacks.remove(&ctx);
        }

        match closed {
            Some(zone) => ZoneOutcome::Stopped(zone),
            None => ZoneOutcome::Unbalanced,
        }
    }

    /// Active zones of `ctx`, outermost first. Empty for unknown contexts.
    pub fn snapshot(&self, ctx: ExecutionId) -> Vec<String> {
        self.stacks()
            .get(&ctx)
            .map(ZoneStack::snapshot)
            .unwrap_or_default()
    }

    /// Tears down `ctx`'s stack, returning the zones it left open (innermost
    /// first).
    pub fn end_context(&self, ctx: ExecutionId, now: Instant) -> Vec<ClosedZone> {
        match self.stacks().remove(&ctx) {
            Some(mut stack) => stack.close_all(now),
            None => Vec::new(),
        }
    }

    /// Number of contexts with at least one open zone.
    pub fn active_contexts(&self) -> usize {
        self.stacks().len()
    }
}
