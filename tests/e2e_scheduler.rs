//! End-to-end control and failure tests: freeze/resume at phase boundaries,
//! the registry, the adaptive loop, and store failures during commit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use spread_rs::config::RetryConfig;
use spread_rs::engine::{ControlHandle, TickProgress};
use spread_rs::events::RecordingSink;
use spread_rs::model::{Boundary, Entity, Membership};
use spread_rs::storage::memory::MemoryTx;
use spread_rs::storage::IdKind;
use spread_rs::{
    CommitId, Engine, EngineConfig, EngineRegistry, EntityId, Error, Filter, GraphStore,
    InstanceId, Link, LinkId, MemoryStore, Node, NodeId, Phase, PhaseObserver, Result,
    StimulusRequest, TxMode, WriteSet,
};

// ============================================================================
// Helpers
// ============================================================================

/// `MemoryStore` whose next `fail_commits` commits fail.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_commits: Arc<AtomicU32>,
    transient: Arc<AtomicBool>,
    commit_attempts: Arc<AtomicU32>,
}

impl FlakyStore {
    fn fail_next(&self, n: u32, transient: bool) {
        self.transient.store(transient, Ordering::SeqCst);
        self.fail_commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl GraphStore for FlakyStore {
    type Tx = MemoryTx;

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx> {
        self.inner.begin_tx(mode).await
    }

    async fn commit_tx(&self, tx: MemoryTx) -> Result<CommitId> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_commits.store(pending - 1, Ordering::SeqCst);
            return Err(if self.transient.load(Ordering::SeqCst) {
                Error::TransientStorage("lock timeout".into())
            } else {
                Error::StorageError("disk full".into())
            });
        }
        self.inner.commit_tx(tx).await
    }

    async fn rollback_tx(&self, tx: MemoryTx) -> Result<()> {
        self.inner.rollback_tx(tx).await
    }

    async fn allocate_id(&self, kind: IdKind) -> Result<u64> {
        self.inner.allocate_id(kind).await
    }

    async fn get_node(&self, tx: &MemoryTx, id: NodeId) -> Result<Option<Node>> {
        self.inner.get_node(tx, id).await
    }

    async fn set_node(&self, tx: &mut MemoryTx, node: Node) -> Result<()> {
        self.inner.set_node(tx, node).await
    }

    async fn nodes(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Node>> {
        self.inner.nodes(tx, filter).await
    }

    async fn get_link(&self, tx: &MemoryTx, id: LinkId) -> Result<Option<Link>> {
        self.inner.get_link(tx, id).await
    }

    async fn set_link(&self, tx: &mut MemoryTx, link: Link) -> Result<()> {
        self.inner.set_link(tx, link).await
    }

    async fn links(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Link>> {
        self.inner.links(tx, filter).await
    }

    async fn get_entity(&self, tx: &MemoryTx, id: EntityId) -> Result<Option<Entity>> {
        self.inner.get_entity(tx, id).await
    }

    async fn set_entity(&self, tx: &mut MemoryTx, entity: Entity) -> Result<()> {
        self.inner.set_entity(tx, entity).await
    }

    async fn remove_entity(&self, tx: &mut MemoryTx, id: EntityId) -> Result<()> {
        self.inner.remove_entity(tx, id).await
    }

    async fn entities(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Entity>> {
        self.inner.entities(tx, filter).await
    }

    async fn memberships(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Membership>> {
        self.inner.memberships(tx, filter).await
    }

    async fn set_membership(&self, tx: &mut MemoryTx, membership: Membership) -> Result<()> {
        self.inner.set_membership(tx, membership).await
    }

    async fn remove_membership(&self, tx: &mut MemoryTx, node: NodeId, entity: EntityId) -> Result<()> {
        self.inner.remove_membership(tx, node, entity).await
    }

    async fn boundaries(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Boundary>> {
        self.inner.boundaries(tx, filter).await
    }

    async fn set_boundary(&self, tx: &mut MemoryTx, boundary: Boundary) -> Result<()> {
        self.inner.set_boundary(tx, boundary).await
    }

    async fn remove_boundary(&self, tx: &mut MemoryTx, source: EntityId, target: EntityId) -> Result<()> {
        self.inner.remove_boundary(tx, source, target).await
    }

    async fn stage(&self, tx: &mut MemoryTx, writes: WriteSet) -> Result<()> {
        self.inner.stage(tx, writes).await
    }
}

/// Two nodes and a link; the source starts above threshold.
async fn seed<S: GraphStore>(store: &S) -> (NodeId, NodeId) {
    let a = store.create_node(Node::new(NodeId(0), "a").with_energy(6.0)).await.unwrap();
    let b = store.create_node(Node::new(NodeId(0), "b")).await.unwrap();
    store.create_link(Link::new(LinkId(0), a, b, "r")).await.unwrap();
    (a, b)
}

fn fast_retry() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig { max_attempts: 3, base_backoff_ms: 1, max_backoff_ms: 2 },
        ..EngineConfig::default()
    }
}

/// Logs phase boundaries and freezes once when redistribution starts.
struct FreezeDuringRedistribution {
    control: ControlHandle,
    armed: AtomicBool,
    log: Arc<Mutex<Vec<(&'static str, Phase)>>>,
}

impl PhaseObserver for FreezeDuringRedistribution {
    fn phase_started(&self, _: &InstanceId, _: u64, phase: Phase) {
        self.log.lock().push(("start", phase));
        if phase == Phase::Redistribution && self.armed.swap(false, Ordering::SeqCst) {
            self.control.freeze();
        }
    }

    fn phase_finished(&self, _: &InstanceId, _: u64, phase: Phase) {
        self.log.lock().push(("finish", phase));
    }
}

// ============================================================================
// 1. Freeze mid-tick: redistribution finishes, selection waits
// ============================================================================

#[tokio::test]
async fn test_freeze_during_redistribution_resumes_at_selection() {
    let store = Arc::new(MemoryStore::new());
    let (a, _) = seed(store.as_ref()).await;
    let commits_before = store.commit_count();

    let control = ControlHandle::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let observer = FreezeDuringRedistribution { control: control.clone(), armed: AtomicBool::new(true), log: log.clone() };
    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "freeze")
        .control(control.clone())
        .observer(observer)
        .events(sink.clone())
        .build()
        .unwrap();

    let progress = engine.advance().await.unwrap();
    assert!(
        matches!(progress, TickProgress::Suspended { tick: 1, next: Phase::Selection }),
        "suspended before selection, got {progress:?}"
    );
    assert_eq!(engine.in_flight(), Some((1, Phase::Selection)));
    assert_eq!(
        *log.lock(),
        vec![
            ("start", Phase::Injection),
            ("finish", Phase::Injection),
            ("start", Phase::Redistribution),
            ("finish", Phase::Redistribution),
        ],
        "redistribution ran to completion"
    );

    // Readers still see the last committed tick.
    assert_eq!(store.commit_count(), commits_before, "nothing committed while suspended");
    assert_eq!(store.snapshot(&Filter::all()).await.unwrap().node(a).unwrap().energy, 6.0);
    assert!(sink.is_empty(), "no events before commit");

    // Still frozen: advancing again does nothing.
    let again = engine.advance().await.unwrap();
    assert!(matches!(again, TickProgress::Suspended { tick: 1, next: Phase::Selection }));

    control.resume();
    let TickProgress::Completed(report) = engine.advance().await.unwrap() else {
        panic!("tick should complete after resume");
    };
    assert_eq!(report.tick, 1);
    assert_eq!(engine.in_flight(), None);

    let log = log.lock();
    let redistributions = log.iter().filter(|(what, p)| *what == "start" && *p == Phase::Redistribution).count();
    assert_eq!(redistributions, 1, "redistribution is not repeated");
    let order: Vec<Phase> = log.iter().filter(|(what, _)| *what == "start").map(|(_, p)| *p).collect();
    assert_eq!(order, Phase::ALL.to_vec());
    assert_eq!(store.snapshot(&Filter::all()).await.unwrap().node(a).unwrap().energy, 3.5, "surplus 5 · 0.5 moved once");
}

// ============================================================================
// 2. Registry: one handle per instance, independent control
// ============================================================================

#[tokio::test]
async fn test_registry_controls_instances_independently() {
    let registry = EngineRegistry::new();
    let (sa, sb) = (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
    seed(sa.as_ref()).await;
    seed(sb.as_ref()).await;
    let mut ea = Engine::builder(sa, "alpha").registry(registry.clone()).build().unwrap();
    let mut eb = Engine::builder(sb, "beta").registry(registry.clone()).build().unwrap();
    assert_eq!(registry.len(), 2);

    let duplicate = Engine::builder(Arc::new(MemoryStore::new()), "alpha").registry(registry.clone()).build();
    assert!(matches!(duplicate, Err(Error::ControlError(_))), "instance ids are unique");

    assert_eq!(registry.freeze_all(), 2);
    assert!(matches!(ea.advance().await.unwrap(), TickProgress::Suspended { tick: 1, next: Phase::Injection }));
    assert!(matches!(eb.advance().await.unwrap(), TickProgress::Suspended { .. }));

    registry.resume(&InstanceId::new("alpha")).unwrap();
    assert!(matches!(ea.advance().await.unwrap(), TickProgress::Completed(_)));
    assert!(matches!(eb.advance().await.unwrap(), TickProgress::Suspended { .. }), "beta stays frozen");

    let alpha = registry.status(&InstanceId::new("alpha")).unwrap();
    assert_eq!(alpha.last_tick, 1);
    assert!(alpha.last_interval.is_some());
    let beta = registry.status(&InstanceId::new("beta")).unwrap();
    assert!(beta.frozen);
    assert_eq!(beta.last_tick, 0);

    drop(eb);
    assert!(!registry.contains(&InstanceId::new("beta")), "dropping an engine deregisters it");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_tick_multiplier_stretches_interval() {
    let mut config = EngineConfig::default();
    config.scheduler.min_interval_ms = 100;
    config.scheduler.max_interval_ms = 1000;

    let registry = EngineRegistry::new();
    let mut plain = Engine::builder(Arc::new(MemoryStore::new()), "plain").config(config.clone()).build().unwrap();
    let mut halved = Engine::builder(Arc::new(MemoryStore::new()), "halved")
        .config(config)
        .registry(registry.clone())
        .build()
        .unwrap();
    registry.set_tick_multiplier(&InstanceId::new("halved"), 0.5).unwrap();
    assert!(registry.set_tick_multiplier(&InstanceId::new("halved"), -1.0).is_err());

    // A quiet graph: σ = 0, so the interval sits near the maximum.
    let base = plain.tick().await.unwrap().next_interval.as_millis() as i64;
    let half = halved.tick().await.unwrap().next_interval.as_millis() as i64;
    assert!((base - 955).abs() <= 1, "base interval {base}");
    assert!((half - base / 2).abs() <= 1, "halved interval {half}");
}

// ============================================================================
// 3. Adaptive loop: wakes for stimulus, stops on request
// ============================================================================

#[tokio::test]
async fn test_run_loop_answers_stimulus_and_stops() {
    let mut config = EngineConfig::default();
    config.scheduler.min_interval_ms = 1;
    config.scheduler.max_interval_ms = 20;
    let store = Arc::new(MemoryStore::new());
    let (_, b) = seed(store.as_ref()).await;
    let mut engine = Engine::builder(store.clone(), "looping").config(config).build().unwrap();
    let control = engine.control();
    let ingress = engine.ingress();

    let (result, outcome) = tokio::join!(engine.run(), async {
        let outcome = ingress.submit(StimulusRequest::node(b, 4.0)).await.unwrap();
        control.stop();
        outcome
    });
    result.unwrap();
    assert_eq!(outcome.injected(), 4.0);
    assert!(engine.last_tick() >= 1);
}

// ============================================================================
// 4. Store failures during commit
// ============================================================================

#[tokio::test]
async fn test_transient_commit_failures_are_retried() {
    let store = Arc::new(FlakyStore::default());
    let (a, _) = seed(store.as_ref()).await;
    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "retry").config(fast_retry()).events(sink.clone()).build().unwrap();

    store.commit_attempts.store(0, Ordering::SeqCst);
    store.fail_next(2, true);
    let report = engine.tick().await.unwrap();
    assert_eq!(report.tick, 1);
    assert_eq!(store.commit_attempts.load(Ordering::SeqCst), 3, "two failures, then success");
    assert_eq!(store.snapshot(&Filter::all()).await.unwrap().node(a).unwrap().energy, 3.5);
    assert!(!sink.is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_tick_and_requeue_stimulus() {
    let store = Arc::new(FlakyStore::default());
    let (a, b) = seed(store.as_ref()).await;
    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "exhausted").config(fast_retry()).events(sink.clone()).build().unwrap();

    let mut reply = engine.ingress().submit(StimulusRequest::node(b, 2.0));
    store.fail_next(10, true);
    let err = engine.tick().await.unwrap_err();
    assert!(matches!(err, Error::TickFailed { tick: 1, attempts: 3, .. }), "got {err}");
    assert!(err.is_transient());

    // Committed state is untouched and nothing was published.
    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert_eq!(snap.node(a).unwrap().energy, 6.0);
    assert_eq!(snap.node(b).unwrap().energy, 0.0);
    assert!(sink.is_empty(), "events are only published after commit");
    assert!(reply.try_recv().is_err(), "no answer for a failed tick");
    assert_eq!(engine.last_tick(), 0);

    // The next tick retries the same tick number with the re-queued stimulus.
    store.fail_next(0, true);
    let report = engine.tick().await.unwrap();
    assert_eq!(report.tick, 1);
    assert_eq!(report.injected, 2.0);
    assert_eq!(reply.await.unwrap().injected(), 2.0);
    assert!(!sink.is_empty());
}

#[tokio::test]
async fn test_persistent_commit_failure_is_not_retried() {
    let store = Arc::new(FlakyStore::default());
    let (a, _) = seed(store.as_ref()).await;
    let mut engine = Engine::builder(store.clone(), "persistent").config(fast_retry()).build().unwrap();

    store.commit_attempts.store(0, Ordering::SeqCst);
    store.fail_next(1, false);
    let err = engine.tick().await.unwrap_err();
    assert!(matches!(err, Error::StorageError(_)), "got {err}");
    assert!(!err.is_transient());
    assert_eq!(store.commit_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.snapshot(&Filter::all()).await.unwrap().node(a).unwrap().energy, 6.0);

    let report = engine.tick().await.unwrap();
    assert_eq!(report.tick, 1, "the failed tick is replayed from committed state");
}

#[tokio::test]
async fn test_run_loop_survives_transient_tick_failure() {
    let mut config = fast_retry();
    config.scheduler.min_interval_ms = 1;
    config.scheduler.max_interval_ms = 5;
    let store = Arc::new(FlakyStore::default());
    seed(store.as_ref()).await;
    store.fail_next(3, true);
    let mut engine = Engine::builder(store.clone(), "resilient").config(config).build().unwrap();
    let control = engine.control();

    let (result, _) = tokio::join!(engine.run(), async {
        while store.inner.commit_count() < 5 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        control.stop();
    });
    result.unwrap();
    assert!(engine.last_tick() >= 1, "ticks continue after the failed one");
}
