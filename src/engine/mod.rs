//! # Tick engine
//!
//! One [`Engine`] owns the tick loop for one graph instance. A tick:
//!
//! 1. loads a [`WorkingGraph`] from committed store state,
//! 2. runs injection, redistribution, selection, learning and lifecycle
//!    against it, checking the control signal before every phase,
//! 3. commits the resulting write set in a single transaction,
//! 4. only then answers stimulus callers, updates the branching tracker
//!    and publishes the tick's events.
//!
//! A frozen engine keeps its in-flight working copy and resumes at the next
//! unexecuted phase; no phase ever runs twice for one tick. A failed tick
//! discards the working copy and re-queues its stimulus.

pub mod control;
pub mod registry;
pub mod scheduler;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, RetryConfig};
use crate::entity::lifecycle::{self, TransitionRecord};
use crate::entity::refresh_aggregates;
use crate::events::{EngineEvent, EventSink, NullSink};
use crate::model::{EntityId, NodeId};
use crate::phases::learning::{self, LearningOutcome};
use crate::phases::redistribution::{self, Contributors, RedistributionOutcome};
use crate::phases::stimulus::{self, InjectionOutcome, StimulusRequest};
use crate::phases::workspace::{self, Workspace};
use crate::phases::{ActivitySnapshot, FlipSubject, InvariantGuard};
use crate::storage::{Filter, GraphSnapshot, GraphStore, IdKind};
use crate::tx::{CommitId, TxMode, WriteSet};
use crate::working::WorkingGraph;
use crate::{Error, Result};

pub use control::{ControlHandle, ControlState};
pub use crate::phases::Phase;
pub use registry::{EngineRegistry, InstanceStatus, RegistrationGuard};
pub use scheduler::{BranchingTracker, Criticality, TickPacer};

// ============================================================================
// Identifiers and hooks
// ============================================================================

/// Identifier of one simulated graph instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Instrumentation hook called around every phase.
pub trait PhaseObserver: Send + Sync {
    fn phase_started(&self, _instance: &InstanceId, _tick: u64, _phase: Phase) {}
    fn phase_finished(&self, _instance: &InstanceId, _tick: u64, _phase: Phase) {}
}

// ============================================================================
// Ingress
// ============================================================================

#[derive(Debug)]
struct Envelope {
    request: StimulusRequest,
    reply: Option<oneshot::Sender<InjectionOutcome>>,
}

/// Cloneable submission handle for stimulus requests.
///
/// Requests are consumed by the next tick. The reply arrives once that tick
/// commits; if the engine is dropped first, the receiver sees a closed
/// channel.
#[derive(Debug, Clone)]
pub struct IngressHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    notify: Arc<Notify>,
}

impl IngressHandle {
    pub fn submit(&self, request: StimulusRequest) -> oneshot::Receiver<InjectionOutcome> {
        let (reply, rx) = oneshot::channel();
        self.push(Envelope { request, reply: Some(reply) });
        rx
    }

    /// Submit without waiting for the outcome.
    pub fn send(&self, request: StimulusRequest) {
        self.push(Envelope { request, reply: None });
    }

    fn push(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!("stimulus dropped: engine is gone");
            return;
        }
        self.notify.notify_one();
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Result of one committed tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub instance: InstanceId,
    pub tick: u64,
    pub commit: CommitId,
    pub writes: usize,
    pub total_energy: f64,
    pub injected: f64,
    pub energy_moved: f64,
    pub energy_delivered: f64,
    pub stride_loss: f64,
    pub decay_loss: f64,
    pub strides: usize,
    pub boundary_strides: usize,
    pub branching_ratio: f64,
    pub smoothed_branching_ratio: f64,
    pub criticality: Criticality,
    pub active_nodes: usize,
    pub active_entities: usize,
    pub flips: usize,
    pub workspace: Workspace,
    pub learning: LearningOutcome,
    pub transitions: Vec<TransitionRecord>,
    pub outcomes: Vec<InjectionOutcome>,
    pub next_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum TickProgress {
    /// Frozen before `next` ran; the tick is still in flight.
    Suspended { tick: u64, next: Phase },
    Completed(TickReport),
}

/// State of a tick between phases.
struct Cursor {
    tick: u64,
    next: Phase,
    graph: WorkingGraph,
    guard: InvariantGuard,
    envelopes: Vec<Envelope>,
    outcomes: Vec<InjectionOutcome>,
    injected: Vec<(NodeId, f64)>,
    redistribution: RedistributionOutcome,
    workspace: Workspace,
    learning: LearningOutcome,
    transitions: Vec<TransitionRecord>,
    events: Vec<EngineEvent>,
}

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder<S: GraphStore> {
    store: Arc<S>,
    id: InstanceId,
    config: EngineConfig,
    filter: Filter,
    events: Arc<dyn EventSink>,
    observer: Option<Arc<dyn PhaseObserver>>,
    registry: Option<EngineRegistry>,
    control: Option<ControlHandle>,
}

impl<S: GraphStore> EngineBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the instance to records matching `filter`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Arc::new(sink);
        self
    }

    pub fn observer(mut self, observer: impl PhaseObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Register with `registry` on build; deregistered when the engine drops.
    pub fn registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn control(mut self, control: ControlHandle) -> Self {
        self.control = Some(control);
        self
    }

    pub fn build(self) -> Result<Engine<S>> {
        self.config.validate()?;
        let control = self.control.unwrap_or_default();
        let registration = match &self.registry {
            Some(r) => Some(r.register(self.id.clone(), control.clone())?),
            None => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        info!(instance = %self.id, "engine built");
        Ok(Engine {
            branching: BranchingTracker::new(self.config.scheduler.branching_window),
            pacer: TickPacer::new(self.config.scheduler.clone()),
            id: self.id,
            store: self.store,
            config: self.config,
            filter: self.filter,
            events: self.events,
            observer: self.observer,
            control,
            registration,
            ingress_tx: tx,
            ingress_rx: rx,
            notify: Arc::new(Notify::new()),
            requeued: Vec::new(),
            cursor: None,
            last_tick: 0,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine<S: GraphStore> {
    id: InstanceId,
    store: Arc<S>,
    config: EngineConfig,
    filter: Filter,
    events: Arc<dyn EventSink>,
    observer: Option<Arc<dyn PhaseObserver>>,
    control: ControlHandle,
    registration: Option<RegistrationGuard>,
    ingress_tx: mpsc::UnboundedSender<Envelope>,
    ingress_rx: mpsc::UnboundedReceiver<Envelope>,
    notify: Arc<Notify>,
    requeued: Vec<Envelope>,
    cursor: Option<Cursor>,
    last_tick: u64,
    branching: BranchingTracker,
    pacer: TickPacer,
}

impl<S: GraphStore> Engine<S> {
    pub fn builder(store: Arc<S>, id: impl Into<InstanceId>) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            id: id.into(),
            config: EngineConfig::default(),
            filter: Filter::all(),
            events: Arc::new(NullSink),
            observer: None,
            registry: None,
            control: None,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn ingress(&self) -> IngressHandle {
        IngressHandle { tx: self.ingress_tx.clone(), notify: self.notify.clone() }
    }

    pub(crate) fn ingress_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn registry(&self) -> Option<&EngineRegistry> {
        self.registration.as_ref().map(|g| g.registry())
    }

    /// Last committed tick, 0 before the first.
    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    /// The in-flight tick and the phase it will run next, if suspended.
    pub fn in_flight(&self) -> Option<(u64, Phase)> {
        self.cursor.as_ref().map(|c| (c.tick, c.next))
    }

    pub fn branching(&self) -> &BranchingTracker {
        &self.branching
    }

    /// Read-isolated view of committed state.
    pub async fn snapshot(&self) -> Result<GraphSnapshot> {
        self.store.snapshot(&self.filter).await
    }

    /// Run phases until the tick commits or the engine is frozen.
    pub async fn advance(&mut self) -> Result<TickProgress> {
        if self.cursor.is_none() {
            if self.control.is_frozen() {
                return Ok(TickProgress::Suspended { tick: self.last_tick + 1, next: Phase::Injection });
            }
            let cursor = self.begin_tick().await?;
            self.cursor = Some(cursor);
        }

        loop {
            let Some(cursor) = self.cursor.as_ref() else { break };
            let (tick, phase) = (cursor.tick, cursor.next);
            if self.control.is_frozen() {
                info!(instance = %self.id, tick, next = %phase, "tick suspended at phase boundary");
                return Ok(TickProgress::Suspended { tick, next: phase });
            }

            if let Some(o) = &self.observer {
                o.phase_started(&self.id, tick, phase);
            }
            if let Err(e) = self.run_phase(phase).await {
                error!(instance = %self.id, tick, %phase, error = %e, "phase failed, tick discarded");
                self.abandon_tick();
                return Err(e);
            }
            if let Some(o) = &self.observer {
                o.phase_finished(&self.id, tick, phase);
            }

            match (phase.next(), self.cursor.as_mut()) {
                (Some(next), Some(c)) => c.next = next,
                _ => break,
            }
        }

        let Some(cursor) = self.cursor.take() else {
            return Err(Error::TxError("no tick in flight".into()));
        };
        self.commit_tick(cursor).await.map(TickProgress::Completed)
    }

    /// Run one whole tick, waiting out any freeze.
    pub async fn tick(&mut self) -> Result<TickReport> {
        loop {
            match self.advance().await? {
                TickProgress::Completed(report) => return Ok(report),
                TickProgress::Suspended { .. } => {
                    if self.control.wait_until_runnable().await.stopped {
                        return Err(Error::ControlError(format!("instance {} stopped mid-tick", self.id)));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick stages
    // ------------------------------------------------------------------

    async fn begin_tick(&mut self) -> Result<Cursor> {
        let tick = self.last_tick + 1;
        let mut envelopes = std::mem::take(&mut self.requeued);
        while let Ok(e) = self.ingress_rx.try_recv() {
            envelopes.push(e);
        }

        let now = chrono::Utc::now();
        let (store, filter) = (self.store.clone(), self.filter.clone());
        let loaded = retry(&self.config.retry, &self.id, tick, "load", || {
            let (store, filter) = (store.clone(), filter.clone());
            async move { WorkingGraph::load(store.as_ref(), &filter, now).await }
        })
        .await;
        let mut graph = match loaded {
            Ok(g) => g,
            Err(e) => {
                self.requeued = envelopes;
                return Err(e);
            }
        };
        refresh_aggregates(&mut graph, self.config.lifecycle.quality_discount);
        debug!(instance = %self.id, tick, nodes = graph.node_ids().len(), stimuli = envelopes.len(), "tick started");

        Ok(Cursor {
            tick,
            next: Phase::Injection,
            graph,
            guard: InvariantGuard::new(self.config.invariant_mode),
            envelopes,
            outcomes: Vec::new(),
            injected: Vec::new(),
            redistribution: RedistributionOutcome::default(),
            workspace: Workspace::default(),
            learning: LearningOutcome::default(),
            transitions: Vec::new(),
            events: Vec::new(),
        })
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<()> {
        // Lifecycle needs fresh ids from the store before it can apply.
        let new_ids = if phase == Phase::Lifecycle {
            let Some(c) = self.cursor.as_mut() else { return Ok(()) };
            let plan = lifecycle::evaluate(&mut c.graph, &self.config.lifecycle, self.config.ema_alpha);
            let tick = c.tick;
            let mut ids = Vec::with_capacity(plan.ids_needed());
            for _ in 0..plan.ids_needed() {
                let store = self.store.clone();
                let id = retry(&self.config.retry, &self.id, tick, "allocate_id", || {
                    let store = store.clone();
                    async move { store.allocate_id(IdKind::Entity).await }
                })
                .await?;
                ids.push(EntityId(id));
            }
            Some((plan, ids))
        } else {
            None
        };

        let cfg = &self.config;
        let instance = &self.id;
        let Some(c) = self.cursor.as_mut() else { return Ok(()) };
        let tick = c.tick;
        match phase {
            Phase::Injection => {
                let before = ActivitySnapshot::capture(&c.graph);
                for env in &c.envelopes {
                    let outcome = stimulus::inject(&mut c.graph, &env.request, &cfg.stimulus, &mut c.guard)?;
                    if let InjectionOutcome::Injected { allocations } = &outcome {
                        c.injected.extend(allocations.iter().copied());
                    }
                    c.outcomes.push(outcome);
                }
                refresh_aggregates(&mut c.graph, cfg.lifecycle.quality_discount);
                for flip in before.flips(&c.graph) {
                    c.events.push(flip_event(instance, tick, phase, flip.subject, flip.now_active, Contributors::new()));
                }
            }
            Phase::Redistribution => {
                c.redistribution = redistribution::redistribute(&mut c.graph, cfg, &mut c.guard)?;
                for r in &c.redistribution.flips {
                    c.events.push(flip_event(instance, tick, phase, r.flip.subject, r.flip.now_active, r.contributors.clone()));
                }
            }
            Phase::Selection => {
                c.workspace = workspace::select(&c.graph, &cfg.workspace);
            }
            Phase::Learning => {
                c.injected.sort_by_key(|(n, _)| *n);
                c.injected.dedup_by(|next, kept| {
                    if next.0 == kept.0 {
                        kept.1 += next.1;
                        true
                    } else {
                        false
                    }
                });
                c.learning = learning::learn(&mut c.graph, &c.workspace, &c.redistribution, &c.injected, cfg, &mut c.guard)?;
            }
            Phase::Lifecycle => {
                if let Some((plan, ids)) = new_ids {
                    let records = lifecycle::apply(&mut c.graph, plan, &mut ids.into_iter(), cfg.lifecycle.quality_discount);
                    for r in &records {
                        c.events.push(EngineEvent::LifecycleTransition {
                            instance: instance.clone(),
                            tick,
                            entity: r.entity,
                            from: r.from,
                            to: r.to,
                            quality: r.quality,
                        });
                    }
                    c.transitions = records;
                }
            }
        }
        debug!(instance = %instance, tick, %phase, "phase finished");
        Ok(())
    }

    async fn commit_tick(&mut self, mut c: Cursor) -> Result<TickReport> {
        let writes = c.graph.write_set();
        let write_count = writes.len();
        let store = self.store.clone();
        let committed = retry(&self.config.retry, &self.id, c.tick, "commit", || {
            let (store, writes) = (store.clone(), writes.clone());
            async move { commit_writes(store.as_ref(), writes).await }
        })
        .await;
        let commit = match committed {
            Ok(id) => id,
            Err(e) => {
                error!(instance = %self.id, tick = c.tick, error = %e, "commit failed, tick discarded");
                self.requeue(std::mem::take(&mut c.envelopes));
                return Err(e);
            }
        };

        // Cross-tick state moves only after a successful commit.
        self.last_tick = c.tick;
        let injected: f64 = c.outcomes.iter().map(InjectionOutcome::injected).sum();
        let r = &c.redistribution;
        let raw = self.branching.measure(r.energy_moved, injected);
        let smoothed = self.branching.record(raw, r.energy_delivered);
        let criticality = Criticality::from_ratio(smoothed);
        let pending = !self.requeued.is_empty() || !self.ingress_rx.is_empty();
        let next_interval = self.pacer.next_interval(smoothed, self.control.tick_multiplier(), pending);
        if let Some(g) = &self.registration {
            g.registry().record_tick(&self.id, c.tick, next_interval, criticality);
        }

        for (env, outcome) in c.envelopes.drain(..).zip(c.outcomes.iter()) {
            if let Some(reply) = env.reply {
                let _ = reply.send(outcome.clone());
            }
        }

        let report = TickReport {
            instance: self.id.clone(),
            tick: c.tick,
            commit,
            writes: write_count,
            total_energy: c.graph.total_energy(),
            injected,
            energy_moved: r.energy_moved,
            energy_delivered: r.energy_delivered,
            stride_loss: r.stride_loss,
            decay_loss: r.decay_loss,
            strides: r.strides.len(),
            boundary_strides: r.boundary_strides.len(),
            branching_ratio: raw,
            smoothed_branching_ratio: smoothed,
            criticality,
            active_nodes: c.graph.active_node_count(),
            active_entities: c.graph.entities().filter(|e| e.is_active()).count(),
            flips: c.events.iter().filter(|e| matches!(e, EngineEvent::ThresholdFlip { .. })).count(),
            workspace: std::mem::take(&mut c.workspace),
            learning: c.learning,
            transitions: std::mem::take(&mut c.transitions),
            outcomes: std::mem::take(&mut c.outcomes),
            next_interval,
        };

        for event in c.events.drain(..) {
            self.events.publish(event);
        }
        self.events.publish(EngineEvent::TickSummary {
            instance: self.id.clone(),
            tick: report.tick,
            total_energy: report.total_energy,
            injected: report.injected,
            energy_moved: report.energy_moved,
            branching_ratio: raw,
            smoothed_branching_ratio: smoothed,
            criticality,
            active_nodes: report.active_nodes,
            active_entities: report.active_entities,
            workspace_size: report.workspace.len(),
        });

        debug!(
            instance = %self.id,
            tick = report.tick,
            energy = report.total_energy,
            moved = report.energy_moved,
            sigma = smoothed,
            interval_ms = next_interval.as_millis() as u64,
            "tick committed"
        );
        Ok(report)
    }

    fn abandon_tick(&mut self) {
        if let Some(mut c) = self.cursor.take() {
            self.requeue(std::mem::take(&mut c.envelopes));
        }
    }

    fn requeue(&mut self, mut envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        warn!(instance = %self.id, count = envelopes.len(), "re-queueing stimulus from failed tick");
        envelopes.append(&mut self.requeued);
        self.requeued = envelopes;
    }
}

fn flip_event(
    instance: &InstanceId,
    tick: u64,
    phase: Phase,
    subject: FlipSubject,
    now_active: bool,
    contributors: Contributors,
) -> EngineEvent {
    EngineEvent::ThresholdFlip {
        instance: instance.clone(),
        tick,
        phase,
        subject,
        was_active: !now_active,
        now_active,
        contributors,
    }
}

async fn commit_writes<S: GraphStore + ?Sized>(store: &S, writes: WriteSet) -> Result<CommitId> {
    let mut tx = store.begin_tx(TxMode::ReadWrite).await?;
    if let Err(e) = store.stage(&mut tx, writes).await {
        store.rollback_tx(tx).await?;
        return Err(e);
    }
    store.commit_tx(tx).await
}

/// Retry `op` on transient errors with exponential backoff. Exhausting the
/// attempts yields [`Error::TickFailed`]; any other error returns at once.
async fn retry<T, F, Fut>(cfg: &RetryConfig, instance: &InstanceId, tick: u64, what: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < cfg.max_attempts => {
                let wait = cfg.backoff(attempt);
                warn!(%instance, tick, op = what, attempt, error = %e, backoff_ms = wait.as_millis() as u64, "transient store error, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::TickFailed { tick, attempts: attempt, source: Box::new(e) });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::model::Node;
    use crate::storage::MemoryStore;

    async fn engine() -> (Engine<MemoryStore>, NodeId, RecordingSink) {
        let store = Arc::new(MemoryStore::new());
        let id = store.create_node(Node::new(NodeId(0), "kettle").with_threshold(5.0)).await.unwrap();
        let sink = RecordingSink::new();
        let engine = Engine::builder(store, "unit").events(sink.clone()).build().unwrap();
        (engine, id, sink)
    }

    #[tokio::test]
    async fn test_tick_answers_ingress_after_commit() {
        let (mut engine, id, sink) = engine().await;
        let reply = engine.ingress().submit(StimulusRequest::node(id, 10.0));
        let report = engine.tick().await.unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!(report.injected, 10.0);
        let outcome = reply.await.unwrap();
        assert_eq!(outcome, InjectionOutcome::Injected { allocations: vec![(id, 10.0)] });
        assert!(matches!(sink.events().last(), Some(EngineEvent::TickSummary { tick: 1, .. })));
    }

    #[tokio::test]
    async fn test_frozen_engine_does_not_start_a_tick() {
        let (mut engine, _, sink) = engine().await;
        engine.control().freeze();
        let progress = engine.advance().await.unwrap();
        assert!(matches!(progress, TickProgress::Suspended { tick: 1, next: Phase::Injection }));
        assert_eq!(engine.last_tick(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_tick_failed() {
        let cfg = RetryConfig { max_attempts: 2, base_backoff_ms: 1, max_backoff_ms: 1 };
        let mut calls = 0;
        let out: Result<()> = retry(&cfg, &InstanceId::new("r"), 7, "commit", || {
            calls += 1;
            async { Err(Error::TransientStorage("busy".into())) }
        })
        .await;
        assert_eq!(calls, 2);
        assert!(matches!(out, Err(Error::TickFailed { tick: 7, attempts: 2, .. })));
    }
}
