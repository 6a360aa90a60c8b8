//! In-memory graph store.
//!
//! This is the reference implementation of `GraphStore`.
//! Committed state is an `Arc<MemoryState>` behind a single `RwLock`.
//! `begin_tx` clones the `Arc`, and a commit copies the state only while
//! some transaction still holds the old view.
//!
//! ## Guarantees
//!
//! - **Atomic commits**: a write set is validated first, then applied under
//!   one write guard. A rejected set leaves state untouched.
//! - **Snapshot reads**: every read in a transaction sees the state committed
//!   when it began. Buffered writes stay invisible, including the reader's own.
//! - **Stable enumeration**: every listing is sorted by id.
//!
//! Use this store for:
//! - Tests and property checks of the tick pipeline
//! - Embedding the engine where persistence is handled elsewhere

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::index::MembershipIndex;
use crate::model::*;
use crate::tx::{CommitId, Transaction, TxId, TxMode, WriteSet};
use crate::{Error, Result};
use super::{Filter, GraphStore, IdKind};

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory activation graph storage. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: RwLock<Arc<MemoryState>>,
    next_node_id: AtomicU64,
    next_link_id: AtomicU64,
    next_entity_id: AtomicU64,
    next_tx_id: AtomicU64,
}

#[derive(Clone, Default)]
struct MemoryState {
    nodes: HashMap<NodeId, Node>,
    links: HashMap<LinkId, Link>,
    entities: HashMap<EntityId, Entity>,
    memberships: MembershipIndex,
    boundaries: HashMap<(EntityId, EntityId), Boundary>,
    commits: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.inner.state.read().commits
    }

    pub fn node_count(&self) -> usize {
        self.inner.state.read().nodes.len()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MemoryStore")
            .field("nodes", &state.nodes.len())
            .field("links", &state.links.len())
            .field("entities", &state.entities.len())
            .field("commits", &state.commits)
            .finish()
    }
}

// ============================================================================
// MemoryTx
// ============================================================================

/// In-memory transaction: an id, a mode, the committed view it reads from
/// and the buffered write set.
pub struct MemoryTx {
    id: TxId,
    mode: TxMode,
    view: Arc<MemoryState>,
    writes: WriteSet,
}

impl std::fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTx")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("view_commit", &self.view.commits)
            .field("writes", &self.writes)
            .finish()
    }
}

impl Transaction for MemoryTx {
    fn mode(&self) -> TxMode { self.mode }
    fn id(&self) -> TxId { self.id }
}

impl MemoryTx {
    fn writable(&mut self) -> Result<&mut WriteSet> {
        match self.mode {
            TxMode::ReadWrite => Ok(&mut self.writes),
            TxMode::ReadOnly => Err(Error::TxError(format!(
                "transaction {} is read-only",
                self.id.0
            ))),
        }
    }
}

// ============================================================================
// Commit validation
// ============================================================================

impl MemoryState {
    /// Reject write sets that would leave dangling references or
    /// out-of-range node state. Runs before anything is applied.
    fn validate(&self, w: &WriteSet) -> Result<()> {
        let staged_nodes: HashSet<NodeId> = w.nodes.iter().map(|n| n.id).collect();
        let staged_entities: HashSet<EntityId> = w.entities.iter().map(|e| e.id).collect();
        let node_exists = |id: NodeId| staged_nodes.contains(&id) || self.nodes.contains_key(&id);
        let entity_exists =
            |id: EntityId| staged_entities.contains(&id) || self.entities.contains_key(&id);

        for n in &w.nodes {
            if !(n.energy >= 0.0) || !n.energy.is_finite() {
                return Err(Error::StorageError(format!("node {} has invalid energy {}", n.id, n.energy)));
            }
            if !(n.threshold > 0.0) {
                return Err(Error::StorageError(format!(
                    "node {} has non-positive threshold {}",
                    n.id, n.threshold
                )));
            }
        }
        for l in &w.links {
            for end in [l.source, l.target] {
                if !node_exists(end) {
                    return Err(Error::NotFound(format!("link {} endpoint {}", l.id, end)));
                }
            }
        }
        for m in &w.memberships {
            if !node_exists(m.node) {
                return Err(Error::NotFound(format!("membership node {}", m.node)));
            }
            if !entity_exists(m.entity) {
                return Err(Error::NotFound(format!("membership entity {}", m.entity)));
            }
        }
        for b in &w.boundaries {
            for end in [b.source, b.target] {
                if !entity_exists(end) {
                    return Err(Error::NotFound(format!("boundary endpoint {}", end)));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, w: WriteSet) {
        for n in w.nodes {
            self.nodes.insert(n.id, n);
        }
        for l in w.links {
            self.links.insert(l.id, l);
        }
        for e in w.entities {
            self.entities.insert(e.id, e);
        }
        for m in &w.memberships {
            self.memberships.insert(m);
        }
        for b in w.boundaries {
            self.boundaries.insert(b.key(), b);
        }
        for (n, e) in w.removed_memberships {
            self.memberships.remove(n, e);
        }
        for key in w.removed_boundaries {
            self.boundaries.remove(&key);
        }
        for e in w.removed_entities {
            self.entities.remove(&e);
            self.memberships.remove_entity(e);
            self.boundaries.retain(|(s, t), _| *s != e && *t != e);
        }
        self.commits += 1;
    }

    fn entity_matches(&self, id: EntityId, filter: &Filter) -> bool {
        self.entities.get(&id).is_some_and(|e| filter.matches_entity(e))
    }

    fn node_matches(&self, id: NodeId, filter: &Filter) -> bool {
        self.nodes.get(&id).is_some_and(|n| filter.matches_node(n))
    }
}

fn sorted<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}

// ============================================================================
// GraphStore impl
// ============================================================================

#[async_trait]
impl GraphStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx> {
        let id = TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed) + 1);
        let view = Arc::clone(&*self.inner.state.read());
        Ok(MemoryTx { id, mode, view, writes: WriteSet::default() })
    }

    async fn commit_tx(&self, tx: MemoryTx) -> Result<CommitId> {
        let MemoryTx { view, writes, .. } = tx;
        drop(view);
        let mut guard = self.inner.state.write();
        if writes.is_empty() {
            return Ok(CommitId(guard.commits));
        }
        guard.validate(&writes)?;
        let state = Arc::make_mut(&mut *guard);
        state.apply(writes);
        Ok(CommitId(state.commits))
    }

    async fn rollback_tx(&self, _tx: MemoryTx) -> Result<()> {
        Ok(())
    }

    async fn allocate_id(&self, kind: IdKind) -> Result<u64> {
        let counter = match kind {
            IdKind::Node => &self.inner.next_node_id,
            IdKind::Link => &self.inner.next_link_id,
            IdKind::Entity => &self.inner.next_entity_id,
        };
        Ok(counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn get_node(&self, tx: &MemoryTx, id: NodeId) -> Result<Option<Node>> {
        Ok(tx.view.nodes.get(&id).cloned())
    }

    async fn set_node(&self, tx: &mut MemoryTx, node: Node) -> Result<()> {
        tx.writable()?.nodes.push(node);
        Ok(())
    }

    async fn nodes(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Node>> {
        let state = &tx.view;
        let out: Vec<Node> = state.nodes.values().filter(|n| filter.matches_node(n)).cloned().collect();
        Ok(sorted(out, |n| n.id))
    }

    // ========================================================================
    // Links
    // ========================================================================

    async fn get_link(&self, tx: &MemoryTx, id: LinkId) -> Result<Option<Link>> {
        Ok(tx.view.links.get(&id).cloned())
    }

    async fn set_link(&self, tx: &mut MemoryTx, link: Link) -> Result<()> {
        tx.writable()?.links.push(link);
        Ok(())
    }

    async fn links(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Link>> {
        let state = &tx.view;
        let out: Vec<Link> = state
            .links
            .values()
            .filter(|l| state.node_matches(l.source, filter) && state.node_matches(l.target, filter))
            .cloned()
            .collect();
        Ok(sorted(out, |l| l.id))
    }

    // ========================================================================
    // Entities
    // ========================================================================

    async fn get_entity(&self, tx: &MemoryTx, id: EntityId) -> Result<Option<Entity>> {
        Ok(tx.view.entities.get(&id).cloned())
    }

    async fn set_entity(&self, tx: &mut MemoryTx, entity: Entity) -> Result<()> {
        tx.writable()?.entities.push(entity);
        Ok(())
    }

    async fn remove_entity(&self, tx: &mut MemoryTx, id: EntityId) -> Result<()> {
        tx.writable()?.removed_entities.push(id);
        Ok(())
    }

    async fn entities(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Entity>> {
        let state = &tx.view;
        let out: Vec<Entity> = state.entities.values().filter(|e| filter.matches_entity(e)).cloned().collect();
        Ok(sorted(out, |e| e.id))
    }

    // ========================================================================
    // Memberships and boundaries
    // ========================================================================

    async fn memberships(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Membership>> {
        let state = &tx.view;
        Ok(state
            .memberships
            .to_memberships()
            .into_iter()
            .filter(|m| state.entity_matches(m.entity, filter) && state.node_matches(m.node, filter))
            .collect())
    }

    async fn set_membership(&self, tx: &mut MemoryTx, membership: Membership) -> Result<()> {
        tx.writable()?.memberships.push(membership);
        Ok(())
    }

    async fn remove_membership(&self, tx: &mut MemoryTx, node: NodeId, entity: EntityId) -> Result<()> {
        tx.writable()?.removed_memberships.push((node, entity));
        Ok(())
    }

    async fn boundaries(&self, tx: &MemoryTx, filter: &Filter) -> Result<Vec<Boundary>> {
        let state = &tx.view;
        let out: Vec<Boundary> = state
            .boundaries
            .values()
            .filter(|b| state.entity_matches(b.source, filter) && state.entity_matches(b.target, filter))
            .cloned()
            .collect();
        Ok(sorted(out, |b| b.key()))
    }

    async fn set_boundary(&self, tx: &mut MemoryTx, boundary: Boundary) -> Result<()> {
        tx.writable()?.boundaries.push(boundary);
        Ok(())
    }

    async fn remove_boundary(&self, tx: &mut MemoryTx, source: EntityId, target: EntityId) -> Result<()> {
        tx.writable()?.removed_boundaries.push((source, target));
        Ok(())
    }

    /// Moves the whole set into the buffer instead of pushing record by record.
    async fn stage(&self, tx: &mut MemoryTx, writes: WriteSet) -> Result<()> {
        let buf = tx.writable()?;
        buf.nodes.extend(writes.nodes);
        buf.links.extend(writes.links);
        buf.entities.extend(writes.entities);
        buf.memberships.extend(writes.memberships);
        buf.boundaries.extend(writes.boundaries);
        buf.removed_entities.extend(writes.removed_entities);
        buf.removed_memberships.extend(writes.removed_memberships);
        buf.removed_boundaries.extend(writes.removed_boundaries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_node() {
        let db = MemoryStore::new();
        let id = db.create_node(Node::new(NodeId(0), "ada").with_threshold(2.0)).await.unwrap();

        let tx = db.begin_tx(TxMode::ReadOnly).await.unwrap();
        let node = db.get_node(&tx, id).await.unwrap().unwrap();
        assert_eq!(node.name, "ada");
        assert_eq!(node.threshold, 2.0);
        assert_eq!(id, NodeId(1));
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let db = MemoryStore::new();
        let id = db.create_node(Node::new(NodeId(0), "a")).await.unwrap();

        let mut tx = db.begin_tx(TxMode::ReadWrite).await.unwrap();
        let mut node = db.get_node(&tx, id).await.unwrap().unwrap();
        node.energy = 4.0;
        db.set_node(&mut tx, node).await.unwrap();
        assert_eq!(db.get_node(&tx, id).await.unwrap().unwrap().energy, 0.0);

        db.commit_tx(tx).await.unwrap();
        let snap = db.snapshot(&Filter::all()).await.unwrap();
        assert_eq!(snap.node(id).unwrap().energy, 4.0);
    }

    #[tokio::test]
    async fn test_listings_share_the_view_from_begin() {
        let db = MemoryStore::new();
        let a = db.create_node(Node::new(NodeId(0), "a")).await.unwrap();
        let b = db.create_node(Node::new(NodeId(0), "b")).await.unwrap();
        let l = db.create_link(Link::new(LinkId(0), a, b, "r")).await.unwrap();

        let reader = db.begin_tx(TxMode::ReadOnly).await.unwrap();
        let nodes = db.nodes(&reader, &Filter::all()).await.unwrap();

        let mut tx = db.begin_tx(TxMode::ReadWrite).await.unwrap();
        db.set_node(&mut tx, Node::new(a, "a").with_energy(3.0)).await.unwrap();
        db.set_link(&mut tx, Link::new(l, a, b, "r").with_weight(3.0)).await.unwrap();
        let c = Node::new(NodeId(50), "c");
        db.set_node(&mut tx, c).await.unwrap();
        db.commit_tx(tx).await.unwrap();

        let links = db.links(&reader, &Filter::all()).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].energy, 0.0);
        assert_eq!(links[0].weight, 1.0, "link listing must come from the same commit as nodes");
        assert_eq!(db.nodes(&reader, &Filter::all()).await.unwrap().len(), 2);
        assert!(db.get_node(&reader, NodeId(50)).await.unwrap().is_none());
        db.rollback_tx(reader).await.unwrap();

        let snap = db.snapshot(&Filter::all()).await.unwrap();
        assert_eq!(snap.nodes.len(), 3);
        assert_eq!(snap.link(l).unwrap().weight, 3.0);
    }

    #[tokio::test]
    async fn test_rejected_commit_applies_nothing() {
        let db = MemoryStore::new();
        let a = db.create_node(Node::new(NodeId(0), "a")).await.unwrap();
        let before = db.commit_count();

        let mut tx = db.begin_tx(TxMode::ReadWrite).await.unwrap();
        db.set_node(&mut tx, Node::new(a, "a").with_energy(9.0)).await.unwrap();
        db.set_link(&mut tx, Link::new(LinkId(1), a, NodeId(99), "dangling")).await.unwrap();
        let err = db.commit_tx(tx).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let snap = db.snapshot(&Filter::all()).await.unwrap();
        assert_eq!(snap.node(a).unwrap().energy, 0.0, "node write must roll back with the link");
        assert_eq!(db.commit_count(), before);
    }

    #[tokio::test]
    async fn test_read_only_tx_rejects_writes() {
        let db = MemoryStore::new();
        let mut tx = db.begin_tx(TxMode::ReadOnly).await.unwrap();
        let err = db.set_node(&mut tx, Node::new(NodeId(1), "x")).await.unwrap_err();
        assert!(matches!(err, Error::TxError(_)));
    }

    #[tokio::test]
    async fn test_remove_entity_keeps_member_nodes() {
        let db = MemoryStore::new();
        let n = db.create_node(Node::new(NodeId(0), "member")).await.unwrap();
        let e = db.create_entity(Entity::new(EntityId(0), "topic", EntityKind::Semantic)).await.unwrap();
        let f = db.create_entity(Entity::new(EntityId(0), "other", EntityKind::Semantic)).await.unwrap();
        db.add_membership(Membership::new(n, e, 1.0)).await.unwrap();
        db.add_boundary(Boundary::new(e, f)).await.unwrap();

        let mut tx = db.begin_tx(TxMode::ReadWrite).await.unwrap();
        db.remove_entity(&mut tx, e).await.unwrap();
        db.commit_tx(tx).await.unwrap();

        let snap = db.snapshot(&Filter::all()).await.unwrap();
        assert!(snap.entity(e).is_none());
        assert!(snap.memberships.is_empty());
        assert!(snap.boundaries.is_empty());
        assert!(snap.node(n).is_some());
    }

    #[tokio::test]
    async fn test_scope_filter_on_links() {
        let db = MemoryStore::new();
        let a = db.create_node(Node::new(NodeId(0), "a").with_scope("alice")).await.unwrap();
        let b = db.create_node(Node::new(NodeId(0), "b").with_scope("alice")).await.unwrap();
        let c = db.create_node(Node::new(NodeId(0), "c").with_scope("bob")).await.unwrap();
        db.create_link(Link::new(LinkId(0), a, b, "r")).await.unwrap();
        db.create_link(Link::new(LinkId(0), a, c, "r")).await.unwrap();

        let snap = db.snapshot(&Filter::scope("alice")).await.unwrap();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.links.len(), 1);
    }
}
