use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ZoneFrame {
    name: String,
    started: Instant,
}

/// A zone that was popped off a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedZone {
    pub name: String,
    pub elapsed: Duration,
    /// Active zones right before the pop, outermost first (includes `name`)
    pub zones: Vec<String>,
}

/// Stack of active zones for one execution context. Not synchronized: each
/// context owns its own stack.
#[derive(Debug, Default)]
pub struct ZoneStack {
    frames: Vec<ZoneFrame>,
}

impl ZoneStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, now: Instant) {
        self.frames.push(ZoneFrame {
            name: name.to_string(),
            started: now,
        });
    }

    /// Pops the most recently started zone. `None` when the stack is empty.
    pub fn pop(&mut self, now: Instant) -> Option<ClosedZone> {
        let zones = self.snapshot();
        let frame = self.frames.pop()?;

        Some(ClosedZone {
            name: frame.name,
            elapsed: now.saturating_duration_since(frame.started),
            zones,
        })
    }

    /// Pops every remaining zone, innermost first.
    pub fn close_all(&mut self, now: Instant) -> Vec<ClosedZone> {
        let mut closed = Vec::with_capacity(self.frames.len());
        while let Some(zone) = self.pop(now) {
            closed.push(zone);
        }
        closed
    }

    /// Active zone names, outermost first.
    pub fn snapshot(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.name.clone()).collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
