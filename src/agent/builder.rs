use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use crate::agent::agent::{AgentInner, Pipeline};
use crate::agent::context::ContextStore;
use crate::agent::events::{AgentEvent, DiagnosticBus};
use crate::agent::{
    Agent, AgentConfig, AgentError, Clock, IdSource, LifecyclePhase, SequenceSource, SystemClock,
    DEFAULT_CHANNEL_CAPACITY,
};
use crate::delivery::worker::{DeliveryWorker, WorkerArgs};
use crate::delivery::{Transport, TransportHandle};
use crate::event::BatchEncoder;
use crate::queue::{EventQueue, JsonSpillStore, QueueLimits};
use crate::zone::ZoneRegistry;

pub struct AgentBuilder {
    account_id: String,
    phase: LifecyclePhase,
    config: Option<AgentConfig>,
    destinations: Vec<(String, TransportHandle)>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdSource>>,
}

impl Agent {
    /// Entry point to configure and start an agent.
    ///
    /// ```no_run
    /// # async fn demo() -> Result<(), zonetrace::AgentError> {
    /// use zonetrace::{Agent, HttpTransport, LifecyclePhase};
    ///
    /// let agent = Agent::builder("acct-1", LifecyclePhase::Release)
    ///     .destination("collector", HttpTransport::new("https://collector.example/v1/events")?)
    ///     .start()?;
    /// agent.report_bug("something odd happened");
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(account_id: impl Into<String>, phase: LifecyclePhase) -> AgentBuilder {
        AgentBuilder {
            account_id: account_id.into(),
            phase,
            config: None,
            destinations: Vec::new(),
            clock: None,
            ids: None,
        }
    }
}

impl AgentBuilder {
    /// Overrides the phase defaults from [`AgentConfig::for_phase`].
    pub fn config(mut self, cfg: AgentConfig) -> Self {
        self.config = Some(cfg);
        self
    }

    pub fn destination(self, name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        self.destination_handle(name, Arc::new(transport))
    }

    pub fn destination_handle(mut self, name: impl Into<String>, transport: TransportHandle) -> Self {
        self.destinations.push((name.into(), transport));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validates the setup, restores spilled events and spawns one delivery
    /// worker per destination on the current Tokio runtime.
    pub fn start(self) -> Result<Agent, AgentError> {
        let runtime = Handle::try_current().map_err(|_| AgentError::NotInRuntime)?;

        if self.account_id.trim().is_empty() {
            return Err(AgentError::validation("account id", "must not be empty"));
        }
        if self.destinations.is_empty() {
            return Err(AgentError::NoDestinations);
        }
        let mut seen = HashSet::new();
        for (name, _) in &self.destinations {
            if name.trim().is_empty() {
                return Err(AgentError::validation("destination", "name must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(AgentError::validation("destination", format!("duplicate name '{name}'")));
            }
        }

        let config = Arc::new(self.config.unwrap_or_else(|| AgentConfig::for_phase(self.phase)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self.ids.unwrap_or_else(|| Arc::new(SequenceSource::new()));
        let bus = DiagnosticBus::default();
        let cancel = CancellationToken::new();
        let encoder = Arc::new(BatchEncoder::new(self.account_id.clone(), self.phase));

        let limits = QueueLimits {
            capacity: config.max_queue_capacity,
            batch_size_threshold: config.batch_size_threshold,
            batch_time_threshold: config.batch_time_threshold,
            max_event_age: config.max_event_age,
        };

        let mut pipelines = Vec::with_capacity(self.destinations.len());
        let mut workers = Vec::with_capacity(self.destinations.len());

        for (name, transport) in self.destinations {
            let queue = Arc::new(EventQueue::new(limits.clone()));
            let spill = config.spill_dir.as_ref().map(|dir| JsonSpillStore::new(dir, &name));

            if let Some(store) = &spill {
                restore_spilled(&name, store, &queue, clock.as_ref(), ids.as_ref(), &config, &bus);
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
            let ready = Arc::new(Notify::new());

            let worker = DeliveryWorker::new(WorkerArgs {
                destination: name.clone(),
                queue: queue.clone(),
                transport,
                encoder: encoder.clone(),
                clock: clock.clone(),
                bus: bus.clone(),
                config: config.clone(),
                ready: ready.clone(),
                cmd_rx,
                cancel: cancel.clone(),
                spill,
            });
            workers.push(runtime.spawn(worker.run()));

            pipelines.push(Pipeline {
                name,
                queue,
                ready,
                cmd_tx,
            });
        }

        log::info!(
            "Agent started for account '{}' ({} phase, {} destination(s))",
            self.account_id,
            self.phase,
            pipelines.len()
        );
        bus.publish(AgentEvent::AgentStarted { phase: self.phase });

        Ok(Agent {
            inner: Arc::new(AgentInner {
                account_id: self.account_id,
                phase: self.phase,
                zones: ZoneRegistry::new(config.max_zone_depth),
                config,
                context: ContextStore::new(),
                clock,
                ids,
                pipelines,
                bus,
                cancel,
                workers: Mutex::new(workers),
                running: AtomicBool::new(true),
                capture_lock: Mutex::new(()),
            }),
        })
    }
}

fn restore_spilled(
    destination: &str,
    store: &JsonSpillStore,
    queue: &EventQueue,
    clock: &dyn Clock,
    ids: &dyn IdSource,
    config: &AgentConfig,
    bus: &DiagnosticBus,
) {
    let events = match store.take() {
        Ok(events) => events,
        Err(e) => {
            log::warn!("Cannot read spilled events for '{}': {}", destination, e);
            return;
        }
    };
    if events.is_empty() {
        return;
    }

    if let Some(max_seq) = events.iter().map(|e| e.event.seq).max() {
        ids.advance_past(max_seq);
    }

    let count = queue.restore(events, clock.now(), clock.now_utc(), &config.retry);
    log::info!("Restored {} spilled events for '{}'", count, destination);
    bus.publish(AgentEvent::EventsRestored {
        destination: destination.to_string(),
        count,
    });
}
