//! End-to-end entity tests: boundary strides and the lifecycle transitions,
//! observed through committed store state and lifecycle events.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use spread_rs::entity::lifecycle::EntityFate;
use spread_rs::events::RecordingSink;
use spread_rs::model::{EntityKind, EntityOrigin, Membership};
use spread_rs::{
    Boundary, Engine, EngineConfig, EngineEvent, Entity, EntityId, Filter, GraphStore, MemoryStore,
    Node, NodeId,
};

// ============================================================================
// Helpers
// ============================================================================

async fn node(store: &MemoryStore, name: &str, energy: f64) -> NodeId {
    store.create_node(Node::new(NodeId(0), name).with_energy(energy)).await.unwrap()
}

async fn entity(store: &MemoryStore, name: &str, members: &[NodeId]) -> EntityId {
    let id = store.create_entity(Entity::new(EntityId(0), name, EntityKind::Functional)).await.unwrap();
    for n in members {
        store.add_membership(Membership::new(*n, id, 1.0)).await.unwrap();
    }
    id
}

fn transitions(sink: &RecordingSink) -> Vec<(u64, EntityId, EntityFate)> {
    sink.events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::LifecycleTransition { tick, entity, to, .. } => Some((tick, entity, to)),
            _ => None,
        })
        .collect()
}

fn lifecycle_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.lifecycle.dissolve_window = 3;
    cfg.lifecycle.split_window = 1;
    cfg.lifecycle.min_dissolve_age = 0;
    cfg
}

// ============================================================================
// 1. Sustained low quality dissolves the entity, never its nodes
// ============================================================================

#[tokio::test]
async fn test_dissolve_removes_memberships_and_keeps_nodes() {
    let store = Arc::new(MemoryStore::new());
    let (a, b) = (node(&store, "a", 0.0).await, node(&store, "b", 0.0).await);
    let e = entity(&store, "idle", &[a, b]).await;

    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "dissolve").config(lifecycle_config()).events(sink.clone()).build().unwrap();
    for _ in 0..2 {
        engine.tick().await.unwrap();
    }
    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert!(snap.entity(e).is_some(), "window not yet reached");
    assert!(snap.entity(e).unwrap().quality_score < 0.2, "quality stays below the low-water mark");

    let report = engine.tick().await.unwrap();
    assert_eq!(report.transitions.len(), 1);

    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert!(snap.entities.is_empty(), "entity removed");
    assert!(snap.memberships.is_empty(), "its memberships removed");
    assert_eq!(snap.nodes.len(), 2, "member nodes remain");
    assert_eq!(transitions(&sink), vec![(3, e, EntityFate::Dissolved)]);
}

// ============================================================================
// 2. Converged entities with shared members merge
// ============================================================================

#[tokio::test]
async fn test_converged_entities_merge() {
    let store = Arc::new(MemoryStore::new());
    let mut members = Vec::new();
    for (i, v) in [[1.0f32, 0.0], [0.9, 0.1], [1.0, 0.2]].into_iter().enumerate() {
        let id = store
            .create_node(Node::new(NodeId(0), format!("n{i}")).with_embedding(v.to_vec()))
            .await
            .unwrap();
        members.push(id);
    }
    let first = entity(&store, "first", &members).await;
    let second = entity(&store, "second", &members).await;

    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "merge").events(sink.clone()).build().unwrap();
    engine.tick().await.unwrap();

    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert_eq!(snap.entities.len(), 1, "one entity survives");
    let survivor = snap.entities[0].id;
    let absorbed = if survivor == first { second } else { first };
    assert_eq!(snap.memberships.len(), 3, "survivor keeps every member");
    assert!(snap.memberships.iter().all(|m| m.entity == survivor));
    assert_eq!(transitions(&sink), vec![(1, absorbed, EntityFate::MergedInto(survivor))]);
}

// ============================================================================
// 3. A bimodal member distribution splits
// ============================================================================

#[tokio::test]
async fn test_bimodal_entity_splits() {
    let store = Arc::new(MemoryStore::new());
    let mut low = Vec::new();
    let mut high = Vec::new();
    for i in 0..3 {
        low.push(node(&store, &format!("cold{i}"), 0.0).await);
        high.push(node(&store, &format!("hot{i}"), 10.0).await);
    }
    let all: Vec<NodeId> = low.iter().chain(&high).copied().collect();
    let parent = entity(&store, "routine", &all).await;

    let sink = RecordingSink::new();
    let mut engine = Engine::builder(store.clone(), "split").config(lifecycle_config()).events(sink.clone()).build().unwrap();
    engine.tick().await.unwrap();

    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert_eq!(snap.entities.len(), 2);
    let child = snap.entities.iter().find(|e| e.id != parent).unwrap();
    assert_eq!(child.name, "routine/split");
    assert_eq!(child.created_from, EntityOrigin::Split);

    let mut moved: Vec<NodeId> = snap.memberships.iter().filter(|m| m.entity == child.id).map(|m| m.node).collect();
    moved.sort();
    assert_eq!(moved, low, "the low-energy mode moves to the child");
    let kept = snap.memberships.iter().filter(|m| m.entity == parent).count();
    assert_eq!(kept, 3);

    let keys: Vec<(EntityId, EntityId)> = snap.boundaries.iter().map(|b| b.key()).collect();
    assert!(keys.contains(&(parent, child.id)) && keys.contains(&(child.id, parent)), "linked both ways: {keys:?}");
    assert_eq!(transitions(&sink), vec![(1, parent, EntityFate::SplitInto(child.id))]);
}

// ============================================================================
// 4. Boundary strides move energy between entities
// ============================================================================

#[tokio::test]
async fn test_boundary_stride_moves_aggregate_energy() {
    let store = Arc::new(MemoryStore::new());
    let (a1, a2) = (node(&store, "a1", 5.0).await, node(&store, "a2", 5.0).await);
    let (b1, b2) = (node(&store, "b1", 0.0).await, node(&store, "b2", 0.0).await);
    let source = entity(&store, "source", &[a1, a2]).await;
    let target = entity(&store, "target", &[b1, b2]).await;
    store.add_boundary(Boundary::new(source, target)).await.unwrap();

    let mut engine = Engine::builder(store.clone(), "boundary").build().unwrap();
    let report = engine.tick().await.unwrap();
    assert_eq!(report.strides, 0, "no links, no node strides");
    assert_eq!(report.boundary_strides, 1);

    // E_rt = 4, Θ_rt = 1 → (4 - 1) · 0.5 · (1 - 0.8) = 0.3
    let snap = store.snapshot(&Filter::all()).await.unwrap();
    assert!((report.energy_moved - 0.3).abs() < 1e-9, "moved {}", report.energy_moved);
    for (id, expected) in [(a1, 4.85), (a2, 4.85), (b1, 0.15), (b2, 0.15)] {
        let e = snap.node(id).unwrap().energy;
        assert!((e - expected).abs() < 1e-9, "{id}: {e} != {expected}");
    }
    assert!((snap.total_energy() - 10.0).abs() < 1e-9, "boundary strides conserve energy");

    let b = &snap.boundaries[0];
    assert_eq!(b.boundary_stride_count, 1);
    assert!((b.ema_flow_mag - 0.03).abs() < 1e-9);
}
