use crate::agent::Agent;
use crate::event::CallSite;
use crate::zone::ExecutionId;

/// Capture and zone operations bound to an explicit execution context.
///
/// ```no_run
/// # async fn demo(agent: zonetrace::Agent) {
/// use zonetrace::ExecutionId;
///
/// let request = agent.for_context(ExecutionId::from(42));
/// request.start_zone("checkout");
/// request.report_bug("card declined");
/// request.end();
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ContextScope<'a> {
    agent: &'a Agent,
    ctx: ExecutionId,
}

impl Agent {
    pub fn for_context(&self, ctx: ExecutionId) -> ContextScope<'_> {
        ContextScope { agent: self, ctx }
    }

    /// Binds `ctx` to a guard that ends the context (auto-closing its zones)
    /// when dropped.
    pub fn enter_context(&self, ctx: ExecutionId) -> ContextGuard {
        ContextGuard {
            agent: self.clone(),
            ctx,
        }
    }
}

impl ContextScope<'_> {
    pub fn id(&self) -> ExecutionId {
        self.ctx
    }

    pub fn start_zone(&self, name: &str) -> bool {
        self.agent.inner.start_zone(self.ctx, name)
    }

    pub fn stop_zone(&self) -> bool {
        self.agent.inner.stop_zone(self.ctx)
    }

    pub fn zones(&self) -> Vec<String> {
        self.agent.inner.zones.snapshot(self.ctx)
    }

    pub fn add_marker(&self, message: &str, site: CallSite) -> bool {
        self.agent.inner.add_marker(self.ctx, message, site)
    }

    #[track_caller]
    pub fn add_marker_here(&self, message: &str) -> bool {
        let site = CallSite::caller();
        self.agent.inner.add_marker(self.ctx, message, site)
    }

    pub fn report_bug(&self, message: &str) -> bool {
        self.agent.inner.report_bug(self.ctx, message)
    }

    pub fn report_exception(&self, name: &str, reason: &str, stack: &str) -> bool {
        self.agent.inner.report_exception(self.ctx, name, reason, stack)
    }

    pub fn report_error<E: std::error::Error + ?Sized>(&self, error: &E) -> bool {
        self.agent.inner.report_error(self.ctx, error)
    }

    /// Ends the context. Zones still open are closed innermost first, each with
    /// a `ZoneStop` event flagged `autoClosed`. Returns how many were closed.
    pub fn end(self) -> usize {
        self.agent.inner.end_context(self.ctx)
    }
}

/// Owned handle on an execution context; ends it on drop.
#[derive(Debug)]
pub struct ContextGuard {
    agent: Agent,
    ctx: ExecutionId,
}

impl ContextGuard {
    pub fn id(&self) -> ExecutionId {
        self.ctx
    }

    pub fn scope(&self) -> ContextScope<'_> {
        self.agent.for_context(self.ctx)
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.agent.inner.end_context(self.ctx);
    }
}
