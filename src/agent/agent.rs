use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::agent::context::{ContextSnapshot, ContextStore};
use crate::agent::events::{AgentEvent, DiagnosticBus, DropReason};
use crate::agent::{AgentConfig, AgentError, Clock, IdSource, LifecyclePhase};
use crate::delivery::worker::{WorkerCommand, WorkerReport};
use crate::event::bridge::js_error_payload;
use crate::event::{
    BugPayload, CallSite, Event, EventBody, ExceptionPayload, JsAction, JsRequest, MarkerPayload,
    TextLimiter, ZoneStartPayload, ZoneStopPayload,
};
use crate::queue::{EventQueue, QueueStats};
use crate::zone::{ClosedZone, ExecutionId, ZoneOutcome, ZoneRegistry};

/// One destination as seen from the capture side.
pub(crate) struct Pipeline {
    pub name: String,
    pub queue: Arc<EventQueue>,
    pub ready: Arc<Notify>,
    pub cmd_tx: mpsc::Sender<WorkerCommand>,
}

pub(crate) struct AgentInner {
    pub account_id: String,
    pub phase: LifecyclePhase,
    pub config: Arc<AgentConfig>,
    pub context: ContextStore,
    pub zones: ZoneRegistry,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
    pub pipelines: Vec<Pipeline>,
    pub bus: DiagnosticBus,
    pub cancel: CancellationToken,
    pub workers: Mutex<Vec<JoinHandle<WorkerReport>>>,
    pub running: AtomicBool,
    /// Held while a sequence number is taken and the event is queued, so every
    /// destination sees events in sequence order.
    pub capture_lock: Mutex<()>,
}

/// The diagnostics agent.
///
/// Cheap to clone; all clones share the same state. Capture operations are
/// synchronous, never block on the network and never panic: they return
/// whether the event was accepted locally, which says nothing about delivery.
///
/// Operations without an explicit context act on [`ExecutionId::current`].
/// Use [`Agent::for_context`] to address a specific one.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("account_id", &self.inner.account_id)
            .field("phase", &self.inner.phase)
            .field("destinations", &self.destinations())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Agent {
    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phase
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn destinations(&self) -> Vec<&str> {
        self.inner.pipelines.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ****************************************
    // ** Context store

    pub fn set_user_class(&self, name: &str) -> bool {
        if name.trim().is_empty() {
            return self.inner.reject(AgentError::validation("user class", "must not be empty"));
        }
        self.inner.context.set_user_class(name);
        true
    }

    pub fn clear_user_class(&self) {
        self.inner.context.clear_user_class();
    }

    pub fn put_user_metadata(&self, key: &str, value: &str) -> bool {
        if key.trim().is_empty() {
            return self.inner.reject(AgentError::validation("metadata key", "must not be empty"));
        }
        self.inner.context.put_user_metadata(key, value);
        true
    }

    pub fn clear_user_metadata(&self, key: &str) {
        self.inner.context.clear_user_metadata(key);
    }

    pub fn clear_all_user_metadata(&self) {
        self.inner.context.clear_all_user_metadata();
    }

    pub fn context_snapshot(&self) -> ContextSnapshot {
        self.inner.context.snapshot()
    }

    // ****************************************
    // ** Capture (current context)

    pub fn start_zone(&self, name: &str) -> bool {
        self.inner.start_zone(ExecutionId::current(), name)
    }

    pub fn stop_zone(&self) -> bool {
        self.inner.stop_zone(ExecutionId::current())
    }

    /// Zones active in the current context, outermost first.
    pub fn current_zones(&self) -> Vec<String> {
        self.inner.zones.snapshot(ExecutionId::current())
    }

    pub fn add_marker(&self, message: &str, site: CallSite) -> bool {
        self.inner.add_marker(ExecutionId::current(), message, site)
    }

    /// [`Agent::add_marker`] with the caller's file and line as call site.
    #[track_caller]
    pub fn add_marker_here(&self, message: &str) -> bool {
        let site = CallSite::caller();
        self.inner.add_marker(ExecutionId::current(), message, site)
    }

    pub fn report_bug(&self, message: &str) -> bool {
        self.inner.report_bug(ExecutionId::current(), message)
    }

    pub fn report_exception(&self, name: &str, reason: &str, stack: &str) -> bool {
        self.inner.report_exception(ExecutionId::current(), name, reason, stack)
    }

    /// Reports any error as an exception: the name is the error's type name,
    /// the reason its message and the stack its `source()` chain.
    pub fn report_error<E: std::error::Error + ?Sized>(&self, error: &E) -> bool {
        self.inner.report_error(ExecutionId::current(), error)
    }

    /// Entry point for the JavaScript bridge.
    pub async fn handle_from_js(&self, action: JsAction, args: &[String]) -> bool {
        let ctx = ExecutionId::current();

        let request = match JsRequest::decode(action, args) {
            Ok(request) => request,
            Err(e) => return self.inner.reject(e),
        };

        match request {
            JsRequest::SendNow => self.send_now().await,
            JsRequest::ReportBug { message } => self.inner.report_bug(ctx, &message),
            JsRequest::ReportException { name, reason, stack } => {
                self.inner.report_exception(ctx, &name, &reason, &stack)
            }
            JsRequest::AddMarker { message, file, class, method, line } => {
                self.inner.add_marker(ctx, &message, CallSite::new(file, class, method, line))
            }
            JsRequest::ReportJsError { message, source, line, column, stack } => {
                let mut limiter = self.inner.limiter();
                let payload = js_error_payload(
                    limiter.text("message", &message),
                    source.map(|s| limiter.text("source", &s)),
                    line,
                    column,
                    stack.map(|s| limiter.stack("stack", &s)),
                );
                let result = self.inner.capture(ctx, None, limiter, EventBody::JsBridge(payload));
                self.inner.accept(result)
            }
        }
    }

    // ****************************************
    // ** Delivery

    /// Attempts every event pending right now on every destination, ignoring
    /// batching thresholds and backoff windows. Resolves once each of them has
    /// been tried at least once; true only when every attempted batch was
    /// accepted.
    pub async fn send_now(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        let mut replies = Vec::with_capacity(self.inner.pipelines.len());
        for pipeline in &self.inner.pipelines {
            let (reply, rx) = oneshot::channel();
            if pipeline.cmd_tx.send(WorkerCommand::SendNow { reply }).await.is_err() {
                log::warn!("Delivery worker for '{}' is gone", pipeline.name);
                return false;
            }
            replies.push(rx);
        }

        let mut all_ok = true;
        for rx in replies {
            all_ok &= rx.await.unwrap_or(false);
        }
        all_ok
    }

    /// Stops accepting events, makes a final delivery attempt bounded by
    /// `shutdown_timeout` and spills (or drops) what is left. Calling it again
    /// is a no-op.
    pub async fn shutdown(&self) {
        {
            let _guard = self.inner.capture_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.inner.running.swap(false, Ordering::AcqRel) {
                return;
            }
        }

        log::debug!("Shutting down agent for account '{}'", self.inner.account_id);
        self.inner.cancel.cancel();

        let workers: Vec<_> = {
            let mut guard = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };

        let mut spilled = 0;
        let mut lost = 0;
        for handle in workers {
            match handle.await {
                Ok(report) => {
                    spilled += report.spilled;
                    lost += report.lost;
                }
                Err(e) => log::error!("Delivery worker ended abnormally: {}", e),
            }
        }

        log::info!("Agent shut down ({} events spilled, {} lost)", spilled, lost);
        self.inner.bus.publish(AgentEvent::AgentShutdown { spilled, lost });
    }

    /// Subscribe to the agent's diagnostic events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.bus.subscribe()
    }

    /// Queue counters per destination.
    pub fn stats(&self) -> BTreeMap<String, QueueStats> {
        self.inner
            .pipelines
            .iter()
            .map(|p| (p.name.clone(), p.queue.stats()))
            .collect()
    }
}

impl AgentInner {
    pub(crate) fn limiter(&self) -> TextLimiter {
        TextLimiter::new(self.config.max_text_len, self.config.max_stack_len)
    }

    /// Turns a capture result into the boolean the public API returns.
    pub(crate) fn accept(&self, result: Result<u64, AgentError>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => self.reject(e),
        }
    }

    pub(crate) fn reject(&self, error: AgentError) -> bool {
        match error {
            AgentError::ShutDown => log::debug!("Capture ignored: agent has been shut down"),
            e => {
                log::warn!("Capture rejected: {}", e);
                self.bus.publish(AgentEvent::CaptureRejected { reason: e.to_string() });
            }
        }
        false
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stamps `body` with context, zones, timestamp and a sequence number, and
    /// queues it on every destination. `zones` defaults to the context's
    /// current stack. Fails with [`AgentError::QueueFull`] when no destination
    /// took the event.
    pub(crate) fn capture(
        &self,
        ctx: ExecutionId,
        zones: Option<Vec<String>>,
        mut limiter: TextLimiter,
        body: EventBody,
    ) -> Result<u64, AgentError> {
        let snapshot = self.context.snapshot();
        let metadata: BTreeMap<String, String> = snapshot
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), limiter.text(&format!("metadata.{k}"), v)))
            .collect();
        let zones = zones.unwrap_or_else(|| self.zones.snapshot(ctx));

        let _guard = self.capture_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            return Err(AgentError::ShutDown);
        }

        let event = Arc::new(Event {
            seq: self.ids.next_seq(),
            ts: self.clock.now_utc(),
            zones,
            user_class: snapshot.user_class,
            metadata,
            body,
            truncated: limiter.into_truncations(),
        });

        if self.config.verbose_diagnostics {
            log::debug!(
                "Captured {} #{} in {} (zones: {:?})",
                event.kind(),
                event.seq,
                ctx,
                event.zones
            );
        }

        let now = self.clock.now();
        let mut accepted = 0;
        for pipeline in &self.pipelines {
            let outcome = pipeline.queue.enqueue(event.clone(), now);
            if outcome.accepted {
                accepted += 1;
            }
            if outcome.evicted > 0 {
                log::warn!(
                    "Queue for '{}' is full; dropped {} event(s)",
                    pipeline.name,
                    outcome.evicted
                );
                self.bus.publish(AgentEvent::EventsDropped {
                    destination: pipeline.name.clone(),
                    count: outcome.evicted,
                    reason: DropReason::Overflow,
                });
            }
            if outcome.ready {
                pipeline.ready.notify_one();
            }
        }

        if accepted == 0 {
            return Err(AgentError::QueueFull);
        }
        Ok(event.seq)
    }

    pub(crate) fn start_zone(&self, ctx: ExecutionId, name: &str) -> bool {
        if !self.is_running() {
            return self.reject(AgentError::ShutDown);
        }

        let mut limiter = self.limiter();
        let name = limiter.text("zone", name);

        let zones = match self.zones.start_zone(ctx, &name, self.clock.now()) {
            Ok(zones) => zones,
            Err(AgentError::ZoneDepthExceeded(max)) => {
                log::warn!("Zone '{}' not started in {}: depth limit of {} reached", name, ctx, max);
                self.bus.publish(AgentEvent::ZoneDepthExceeded { context: ctx, zone: name });
                return false;
            }
            Err(e) => return self.reject(e),
        };

        let body = EventBody::ZoneStart(ZoneStartPayload { zone: name });
        match self.capture(ctx, Some(zones), limiter, body) {
            Ok(_) => true,
            Err(e) => {
                // the zone never made it into the stream, so it must not stay open
                if let ZoneOutcome::Stopped(zone) = self.zones.stop_zone(ctx, self.clock.now()) {
                    log::debug!("Rolled back zone '{}' in {}", zone.name, ctx);
                }
                self.reject(e)
            }
        }
    }

    pub(crate) fn stop_zone(&self, ctx: ExecutionId) -> bool {
        if !self.is_running() {
            return self.reject(AgentError::ShutDown);
        }

        match self.zones.stop_zone(ctx, self.clock.now()) {
            ZoneOutcome::Stopped(closed) => self.accept(self.capture_zone_stop(ctx, closed, false)),
            ZoneOutcome::Unbalanced => {
                log::warn!("stop_zone called in {} with no active zone", ctx);
                self.bus.publish(AgentEvent::UnbalancedZone { context: ctx });
                false
            }
        }
    }

    fn capture_zone_stop(&self, ctx: ExecutionId, closed: ClosedZone, auto_closed: bool) -> Result<u64, AgentError> {
        let body = EventBody::ZoneStop(ZoneStopPayload {
            zone: closed.name,
            elapsed_ms: u64::try_from(closed.elapsed.as_millis()).unwrap_or(u64::MAX),
            auto_closed,
        });
        self.capture(ctx, Some(closed.zones), self.limiter(), body)
    }

    /// Closes every zone `ctx` left open, innermost first, and forgets the
    /// context. Returns how many zones were closed.
    pub(crate) fn end_context(&self, ctx: ExecutionId) -> usize {
        let closed = self.zones.end_context(ctx, self.clock.now());
        let count = closed.len();

        for zone in closed {
            log::warn!("Zone '{}' still open when {} ended; closing it", zone.name, ctx);
            self.bus.publish(AgentEvent::ZoneAutoClosed {
                context: ctx,
                zone: zone.name.clone(),
            });
            self.accept(self.capture_zone_stop(ctx, zone, true));
        }

        count
    }

    pub(crate) fn add_marker(&self, ctx: ExecutionId, message: &str, site: CallSite) -> bool {
        if message.trim().is_empty() {
            return self.reject(AgentError::validation("message", "must not be empty"));
        }

        let mut limiter = self.limiter();
        let body = EventBody::Marker(MarkerPayload {
            message: limiter.text("message", message),
            file: limiter.text("file", &site.file),
            class: limiter.text("class", &site.class),
            method: limiter.text("method", &site.method),
            line: site.line,
        });
        self.accept(self.capture(ctx, None, limiter, body))
    }

    pub(crate) fn report_bug(&self, ctx: ExecutionId, message: &str) -> bool {
        if message.trim().is_empty() {
            return self.reject(AgentError::validation("message", "must not be empty"));
        }

        let mut limiter = self.limiter();
        let body = EventBody::Bug(BugPayload {
            message: limiter.text("message", message),
        });
        self.accept(self.capture(ctx, None, limiter, body))
    }

    pub(crate) fn report_exception(&self, ctx: ExecutionId, name: &str, reason: &str, stack: &str) -> bool {
        if name.trim().is_empty() {
            return self.reject(AgentError::validation("exception name", "must not be empty"));
        }

        let mut limiter = self.limiter();
        let body = EventBody::Exception(ExceptionPayload {
            name: limiter.text("name", name),
            reason: limiter.text("reason", reason),
            stack: limiter.stack("stack", stack),
        });
        self.accept(self.capture(ctx, None, limiter, body))
    }

    pub(crate) fn report_error<E: std::error::Error + ?Sized>(&self, ctx: ExecutionId, error: &E) -> bool {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        self.report_exception(ctx, std::any::type_name::<E>(), &error.to_string(), &chain.join("\n"))
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        // Last handle gone without shutdown(): let the workers flush and spill
        // on their own.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;
    use crate::agent::{ManualClock, SequenceSource};
    use crate::delivery::{RecordingTransport, RetryPolicy};
    use crate::event::EventKind;

    fn test_config() -> AgentConfig {
        AgentConfig {
            batch_size_threshold: 100,
            batch_time_threshold: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: 0.0,
                max_attempts: 3,
            },
            ..AgentConfig::default()
        }
    }

    fn start(transport: Arc<RecordingTransport>) -> Agent {
        start_with(transport, test_config())
    }

    fn start_with(transport: Arc<RecordingTransport>, config: AgentConfig) -> Agent {
        Agent::builder("acct-1", LifecyclePhase::Release)
            .config(config)
            .destination_handle("primary", transport)
            .clock(Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC))))
            .start()
            .unwrap()
    }

    fn events(transport: &RecordingTransport) -> Vec<serde_json::Value> {
        transport
            .accepted()
            .iter()
            .flat_map(|send| send.json()["events"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn checkout_scenario_delivers_one_batch() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());

        assert!(agent.start_zone("checkout"));
        assert!(agent.report_bug("card declined"));
        assert!(agent.stop_zone());
        assert!(agent.send_now().await);

        assert_eq!(transport.accepted().len(), 1);
        let events = events(&transport);
        assert_eq!(events.len(), 3);

        let bug = &events[1];
        assert_eq!(bug["kind"], "bug");
        assert_eq!(bug["payload"]["message"], "card declined");
        assert_eq!(bug["zones"], serde_json::json!(["checkout"]));
        assert_eq!(events[2]["kind"], "zone_stop");
        assert_eq!(events[2]["zones"], serde_json::json!(["checkout"]));
        assert!(agent.current_zones().is_empty());

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn nested_zones_are_tagged_outermost_first() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());

        agent.start_zone("checkout");
        agent.start_zone("paymentValidation");
        agent.add_marker("validating", CallSite::new("pay.rs", "Payment", "validate", 42));
        agent.stop_zone();
        agent.add_marker_here("back in checkout");
        agent.stop_zone();
        assert!(agent.send_now().await);

        let events = events(&transport);
        let kinds: Vec<_> = events.iter().map(|e| e["kind"].as_str().unwrap().to_string()).collect();
        assert_eq!(
            kinds,
            vec!["zone_start", "zone_start", "marker", "zone_stop", "marker", "zone_stop"]
        );
        assert_eq!(events[2]["zones"], serde_json::json!(["checkout", "paymentValidation"]));
        assert_eq!(events[2]["payload"]["line"], 42);
        assert_eq!(events[3]["payload"]["zone"], "paymentValidation");
        assert_eq!(events[4]["zones"], serde_json::json!(["checkout"]));
        assert!(events[4]["payload"]["file"].as_str().unwrap().ends_with("agent.rs"));

        let seqs: Vec<_> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn validation_failures_return_false() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());
        let mut rx = agent.subscribe_events();

        assert!(!agent.report_bug(""));
        assert!(!agent.add_marker("  ", CallSite::default()));
        assert!(!agent.report_exception("", "reason", "stack"));
        assert!(!agent.start_zone(""));
        assert!(!agent.set_user_class(""));

        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::CaptureRejected { .. }));
        assert_eq!(agent.stats()["primary"].enqueued, 0);
    }

    #[tokio::test]
    async fn unbalanced_stop_is_reported_not_fatal() {
        let agent = start(Arc::new(RecordingTransport::new()));
        let mut rx = agent.subscribe_events();

        assert!(!agent.stop_zone());
        assert_eq!(
            rx.try_recv().unwrap(),
            AgentEvent::UnbalancedZone { context: ExecutionId::current() }
        );
        assert!(agent.report_bug("still works"));
    }

    #[tokio::test]
    async fn zone_depth_is_capped() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(AgentConfig {
                max_zone_depth: 2,
                ..test_config()
            })
            .destination_handle("primary", transport)
            .start()
            .unwrap();
        let mut rx = agent.subscribe_events();

        assert!(agent.start_zone("a"));
        assert!(agent.start_zone("b"));
        assert!(!agent.start_zone("c"));
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::ZoneDepthExceeded { zone, .. } if zone == "c"));
        assert_eq!(agent.current_zones(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn captured_context_is_a_copy() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());

        agent.set_user_class("beta");
        agent.put_user_metadata("cart", "3 items");
        agent.report_bug("first");
        agent.put_user_metadata("cart", "empty");
        agent.clear_user_class();
        agent.report_bug("second");
        assert!(agent.send_now().await);

        let events = events(&transport);
        assert_eq!(events[0]["userClass"], "beta");
        assert_eq!(events[0]["metadata"]["cart"], "3 items");
        assert_eq!(events[1]["userClass"], serde_json::Value::Null);
        assert_eq!(events[1]["metadata"]["cart"], "empty");
    }

    #[tokio::test]
    async fn long_text_is_truncated_and_recorded() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(AgentConfig {
                max_text_len: 4,
                ..test_config()
            })
            .destination_handle("primary", transport.clone())
            .start()
            .unwrap();

        agent.put_user_metadata("k", "abcdef");
        agent.report_bug("hello world");
        assert!(agent.send_now().await);

        let event = &events(&transport)[0];
        assert_eq!(event["payload"]["message"], "hell");
        assert_eq!(event["metadata"]["k"], "abcd");
        assert_eq!(event["truncated"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn report_error_walks_the_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("payment failed")]
        struct PaymentError(#[source] std::io::Error);

        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());

        let err = PaymentError(std::io::Error::new(std::io::ErrorKind::Other, "socket closed"));
        assert!(agent.report_error(&err));
        assert!(agent.send_now().await);

        let event = &events(&transport)[0];
        assert_eq!(event["kind"], "exception");
        assert!(event["payload"]["name"].as_str().unwrap().ends_with("PaymentError"));
        assert_eq!(event["payload"]["reason"], "payment failed");
        assert_eq!(event["payload"]["stack"], "caused by: socket closed");
    }

    #[tokio::test]
    async fn js_bridge_dispatch() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());
        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(agent.handle_from_js(JsAction::ReportBug, &args(&["from js"])).await);
        assert!(agent.handle_from_js(JsAction::AddMarker, &args(&["tap", "app.js", "", "onTap", "9"])).await);
        assert!(
            agent
                .handle_from_js(JsAction::ReportJsError, &args(&["x is undefined", "app.js", "3", "", "at f"]))
                .await
        );
        assert!(!agent.handle_from_js(JsAction::ReportException, &[]).await);
        assert!(agent.handle_from_js(JsAction::SendNow, &[]).await);

        let events = events(&transport);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["kind"], "bug");
        assert_eq!(events[1]["payload"]["method"], "onTap");
        assert_eq!(events[2]["kind"], "js_bridge");
        assert_eq!(
            events[2]["payload"],
            serde_json::json!({
                "action": "report_js_error",
                "args": ["x is undefined", "app.js", "3", "", "at f"]
            })
        );
    }

    #[tokio::test]
    async fn send_now_reports_failure() {
        let transport = Arc::new(RecordingTransport::with_script([Err(
            crate::agent::DeliveryError::Transient("503".into()),
        )]));
        let agent = start(transport.clone());

        agent.report_bug("lost connection");
        assert!(!agent.send_now().await);
        assert_eq!(agent.stats()["primary"].pending, 1);

        // send_now ignores the backoff window
        assert!(agent.send_now().await);
        assert_eq!(transport.accepted_seqs(), vec![1]);
    }

    #[tokio::test]
    async fn send_now_on_empty_queue_succeeds() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());
        assert!(agent.send_now().await);
        assert!(transport.sends().is_empty());
    }

    #[tokio::test]
    async fn every_destination_gets_every_event() {
        let first = Arc::new(RecordingTransport::new());
        let second = Arc::new(RecordingTransport::with_script([Err(
            crate::agent::DeliveryError::Permanent("400".into()),
        )]));
        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(test_config())
            .destination_handle("first", first.clone())
            .destination_handle("second", second.clone())
            .start()
            .unwrap();

        agent.report_bug("one");
        agent.report_bug("two");
        assert!(!agent.send_now().await);

        assert_eq!(first.accepted_seqs(), vec![1, 2]);
        assert!(second.accepted().is_empty());
        assert_eq!(agent.stats()["second"].dropped, 2);

        agent.report_bug("three");
        assert!(agent.send_now().await);
        assert_eq!(second.accepted_seqs(), vec![3]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(AgentConfig {
                max_queue_capacity: 3,
                ..test_config()
            })
            .destination_handle("primary", transport.clone())
            .start()
            .unwrap();
        let mut rx = agent.subscribe_events();

        for i in 0..5 {
            agent.report_bug(&format!("bug {i}"));
        }
        assert_eq!(agent.stats()["primary"].evicted, 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            AgentEvent::EventsDropped { reason: DropReason::Overflow, count: 1, .. }
        ));

        assert!(agent.send_now().await);
        assert_eq!(transport.accepted_seqs(), vec![3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_capture_is_conserved() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let transport = Arc::new(RecordingTransport::new());
        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(AgentConfig {
                max_queue_capacity: THREADS * (PER_THREAD + 2),
                max_batch_size: 500,
                ..test_config()
            })
            .destination_handle("primary", transport.clone())
            .start()
            .unwrap();

        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let agent = agent.clone();
                std::thread::spawn(move || {
                    agent.start_zone(&format!("thread-{t}"));
                    for i in 0..PER_THREAD {
                        assert!(agent.add_marker(&format!("{t}/{i}"), CallSite::default()));
                    }
                    // zone events are not markers; close without another event
                    agent.stop_zone();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(agent.send_now().await);

        let markers: Vec<_> = events(&transport)
            .into_iter()
            .filter(|e| e["kind"] == "marker")
            .collect();
        assert_eq!(markers.len(), THREADS * PER_THREAD);

        // each marker carries only its own thread's zone
        for marker in &markers {
            let message = marker["payload"]["message"].as_str().unwrap();
            let thread = message.split('/').next().unwrap();
            assert_eq!(marker["zones"], serde_json::json!([format!("thread-{thread}")]));
        }

        let seqs = transport.accepted_seqs();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(EventKind::Marker.to_string(), "marker");
    }

    #[tokio::test]
    async fn capture_after_shutdown_is_refused() {
        let transport = Arc::new(RecordingTransport::new());
        let agent = start(transport.clone());

        agent.report_bug("before");
        agent.shutdown().await;

        assert_eq!(transport.accepted_seqs(), vec![1]);
        assert!(!agent.report_bug("after"));
        assert!(!agent.send_now().await);
        assert!(!agent.is_running());

        // second shutdown is a no-op
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn sequence_source_can_be_injected() {
        let transport = Arc::new(RecordingTransport::new());
        let ids = Arc::new(SequenceSource::new());
        ids.advance_past(99);

        let agent = Agent::builder("acct-1", LifecyclePhase::Release)
            .config(test_config())
            .destination_handle("primary", transport.clone())
            .id_source(ids)
            .start()
            .unwrap();

        agent.report_bug("x");
        assert!(agent.send_now().await);
        assert_eq!(transport.accepted_seqs(), vec![100]);
    }

    /// Queue of one whose only event is held in flight by a slow transport.
    async fn saturated() -> (Agent, Arc<RecordingTransport>, tokio::task::JoinHandle<bool>) {
        let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_secs(5)));
        let agent = start_with(
            transport.clone(),
            AgentConfig {
                max_queue_capacity: 1,
                ..test_config()
            },
        );

        assert!(agent.report_bug("first"));
        let sending = tokio::spawn({
            let agent = agent.clone();
            async move { agent.send_now().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.stats()["primary"].in_flight, 1);

        (agent, transport, sending)
    }

    #[tokio::test(start_paused = true)]
    async fn capture_fails_when_no_queue_takes_the_event() {
        let (agent, transport, sending) = saturated().await;
        let mut rx = agent.subscribe_events();

        assert!(!agent.report_bug("second"));
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::EventsDropped { reason: DropReason::Overflow, .. }));
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::CaptureRejected { .. }));

        assert!(sending.await.unwrap());
        assert_eq!(transport.accepted_seqs(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn zone_is_not_left_open_when_its_start_is_dropped() {
        let (agent, _transport, sending) = saturated().await;

        assert!(!agent.start_zone("late"));
        assert!(agent.current_zones().is_empty());
        assert!(!agent.stop_zone());

        assert!(sending.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_closed_zone_that_cannot_be_queued_is_reported() {
        let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_secs(5)));
        let agent = start_with(
            transport.clone(),
            AgentConfig {
                max_queue_capacity: 1,
                ..test_config()
            },
        );

        let scope = agent.for_context(ExecutionId::from(3));
        assert!(scope.start_zone("upload"));
        let sending = tokio::spawn({
            let agent = agent.clone();
            async move { agent.send_now().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut rx = agent.subscribe_events();
        assert_eq!(scope.end(), 1);
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::ZoneAutoClosed { zone, .. } if zone == "upload"));
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::EventsDropped { reason: DropReason::Overflow, .. }));
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::CaptureRejected { .. }));

        assert!(sending.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_while_a_send_is_in_flight() {
        let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_secs(30)));
        let agent = start_with(
            transport.clone(),
            AgentConfig {
                send_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_secs(1),
                ..test_config()
            },
        );
        let mut rx = agent.subscribe_events();

        assert!(agent.report_bug("slow"));
        let sending = tokio::spawn({
            let agent = agent.clone();
            async move { agent.send_now().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        agent.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!sending.await.unwrap());

        let lost = loop {
            if let AgentEvent::AgentShutdown { lost, .. } = rx.recv().await.unwrap() {
                break lost;
            }
        };
        assert_eq!(lost, 1);
    }
}
