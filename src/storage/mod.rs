//! # Graph Store Trait
//!
//! This is THE contract between the engine and persistence. The engine
//! reads one committed view at the start of a tick and writes one batch
//! at the end; everything in between happens on a private working copy.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `memory` | In-memory, atomic commits, for tests and embedding |
//!
//! ## Consistency contract
//!
//! - Every read inside a transaction sees the state committed when it
//!   began. Listings taken through one transaction agree with each other.
//! - A read-write transaction buffers its writes; `commit_tx` applies them
//!   all or none. Readers never observe half a tick.
//! - Display readers use [`GraphStore::snapshot`], never the engine's copy.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::model::*;
use crate::tx::{CommitId, Transaction, TxMode, WriteSet};
use crate::Result;

pub use memory::MemoryStore;

// ============================================================================
// Filters
// ============================================================================

/// Scope / kind filter for enumeration.
///
/// Nodes match on scope. Links match when both endpoints match. Entities
/// match on scope and kind. Memberships and boundaries match when every
/// entity they touch matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub scope: Option<Scope>,
    pub entity_kind: Option<EntityKind>,
}

impl Filter {
    /// Everything in the store.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn scope(scope: impl Into<String>) -> Self {
        Self { scope: Some(Scope::new(scope)), entity_kind: None }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = Some(kind);
        self
    }

    pub fn matches_node(&self, node: &Node) -> bool {
        self.scope.as_ref().is_none_or(|s| *s == node.scope)
    }

    pub fn matches_entity(&self, entity: &Entity) -> bool {
        self.scope.as_ref().is_none_or(|s| *s == entity.scope)
            && self.entity_kind.is_none_or(|k| k == entity.kind)
    }
}

/// Kind of identifier to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Node,
    Link,
    Entity,
}

// ============================================================================
// Snapshot
// ============================================================================

/// A read-isolated view of committed state. All lists are sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub entities: Vec<Entity>,
    pub memberships: Vec<Membership>,
    pub boundaries: Vec<Boundary>,
}

impl GraphSnapshot {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn total_energy(&self) -> f64 {
        self.nodes.iter().map(|n| n.energy).sum()
    }
}

// ============================================================================
// GraphStore Trait
// ============================================================================

/// The persistence contract.
///
/// Failures should be reported as [`Error::TransientStorage`](crate::Error::TransientStorage)
/// when a retry may succeed and [`Error::StorageError`](crate::Error::StorageError)
/// otherwise; the engine retries only the former.
#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// The transaction type for this store.
    type Tx: Transaction;

    // ========================================================================
    // Transactions
    // ========================================================================

    async fn begin_tx(&self, mode: TxMode) -> Result<Self::Tx>;

    /// Apply every buffered write atomically.
    async fn commit_tx(&self, tx: Self::Tx) -> Result<CommitId>;

    /// Discard buffered writes.
    async fn rollback_tx(&self, tx: Self::Tx) -> Result<()>;

    /// Issue a fresh identifier. Identifiers are never reused.
    async fn allocate_id(&self, kind: IdKind) -> Result<u64>;

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn get_node(&self, tx: &Self::Tx, id: NodeId) -> Result<Option<Node>>;

    /// Upsert the full node record.
    async fn set_node(&self, tx: &mut Self::Tx, node: Node) -> Result<()>;

    async fn nodes(&self, tx: &Self::Tx, filter: &Filter) -> Result<Vec<Node>>;

    // ========================================================================
    // Links
    // ========================================================================

    async fn get_link(&self, tx: &Self::Tx, id: LinkId) -> Result<Option<Link>>;

    async fn set_link(&self, tx: &mut Self::Tx, link: Link) -> Result<()>;

    async fn links(&self, tx: &Self::Tx, filter: &Filter) -> Result<Vec<Link>>;

    // ========================================================================
    // Entities
    // ========================================================================

    async fn get_entity(&self, tx: &Self::Tx, id: EntityId) -> Result<Option<Entity>>;

    async fn set_entity(&self, tx: &mut Self::Tx, entity: Entity) -> Result<()>;

    /// Remove an entity together with its memberships and boundaries.
    /// Member nodes are untouched.
    async fn remove_entity(&self, tx: &mut Self::Tx, id: EntityId) -> Result<()>;

    async fn entities(&self, tx: &Self::Tx, filter: &Filter) -> Result<Vec<Entity>>;

    // ========================================================================
    // Memberships (BELONGS_TO) and boundaries (RELATES_TO)
    // ========================================================================

    async fn memberships(&self, tx: &Self::Tx, filter: &Filter) -> Result<Vec<Membership>>;

    async fn set_membership(&self, tx: &mut Self::Tx, membership: Membership) -> Result<()>;

    async fn remove_membership(&self, tx: &mut Self::Tx, node: NodeId, entity: EntityId) -> Result<()>;

    async fn boundaries(&self, tx: &Self::Tx, filter: &Filter) -> Result<Vec<Boundary>>;

    async fn set_boundary(&self, tx: &mut Self::Tx, boundary: Boundary) -> Result<()>;

    async fn remove_boundary(&self, tx: &mut Self::Tx, source: EntityId, target: EntityId) -> Result<()>;

    // ========================================================================
    // Batch operations (default: sequential, override for bulk paths)
    // ========================================================================

    /// Stage a whole write set in `tx`. Upserts first, then removals.
    async fn stage(&self, tx: &mut Self::Tx, writes: WriteSet) -> Result<()> {
        let WriteSet {
            nodes,
            links,
            entities,
            memberships,
            boundaries,
            removed_entities,
            removed_memberships,
            removed_boundaries,
        } = writes;
        for n in nodes {
            self.set_node(tx, n).await?;
        }
        for l in links {
            self.set_link(tx, l).await?;
        }
        for e in entities {
            self.set_entity(tx, e).await?;
        }
        for m in memberships {
            self.set_membership(tx, m).await?;
        }
        for b in boundaries {
            self.set_boundary(tx, b).await?;
        }
        for (n, e) in removed_memberships {
            self.remove_membership(tx, n, e).await?;
        }
        for (s, t) in removed_boundaries {
            self.remove_boundary(tx, s, t).await?;
        }
        for e in removed_entities {
            self.remove_entity(tx, e).await?;
        }
        Ok(())
    }

    /// Read-isolated view of committed state for display readers.
    ///
    /// All five listings come from one read-only transaction, so they
    /// describe the same commit.
    async fn snapshot(&self, filter: &Filter) -> Result<GraphSnapshot> {
        let tx = self.begin_tx(TxMode::ReadOnly).await?;
        let snap = GraphSnapshot {
            nodes: self.nodes(&tx, filter).await?,
            links: self.links(&tx, filter).await?,
            entities: self.entities(&tx, filter).await?,
            memberships: self.memberships(&tx, filter).await?,
            boundaries: self.boundaries(&tx, filter).await?,
        };
        self.rollback_tx(tx).await?;
        Ok(snap)
    }

    // ========================================================================
    // Ingestion conveniences: each call is its own committed transaction
    // ========================================================================

    /// Store a node under a freshly allocated id; the id on `node` is ignored.
    async fn create_node(&self, mut node: Node) -> Result<NodeId> {
        node.id = NodeId(self.allocate_id(IdKind::Node).await?);
        let id = node.id;
        let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
        self.set_node(&mut tx, node).await?;
        self.commit_tx(tx).await?;
        Ok(id)
    }

    /// Store a link under a freshly allocated id; the id on `link` is ignored.
    async fn create_link(&self, mut link: Link) -> Result<LinkId> {
        link.id = LinkId(self.allocate_id(IdKind::Link).await?);
        let id = link.id;
        let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
        self.set_link(&mut tx, link).await?;
        self.commit_tx(tx).await?;
        Ok(id)
    }

    /// Store an entity under a freshly allocated id; the id on `entity` is ignored.
    async fn create_entity(&self, mut entity: Entity) -> Result<EntityId> {
        entity.id = EntityId(self.allocate_id(IdKind::Entity).await?);
        let id = entity.id;
        let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
        self.set_entity(&mut tx, entity).await?;
        self.commit_tx(tx).await?;
        Ok(id)
    }

    async fn add_membership(&self, membership: Membership) -> Result<()> {
        let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
        self.set_membership(&mut tx, membership).await?;
        self.commit_tx(tx).await?;
        Ok(())
    }

    async fn add_boundary(&self, boundary: Boundary) -> Result<()> {
        let mut tx = self.begin_tx(TxMode::ReadWrite).await?;
        self.set_boundary(&mut tx, boundary).await?;
        self.commit_tx(tx).await?;
        Ok(())
    }
}
