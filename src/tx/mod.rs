//! Store transactions and the per-tick write set.
//!
//! A tick reads its working copy from committed state, then hands every
//! mutation to the store as one [`WriteSet`] inside a read-write transaction.
//! The store applies the whole set on commit or none of it.

use serde::{Deserialize, Serialize};
use crate::model::*;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Sequence number of a committed write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub u64);

/// Transaction trait that all stores must implement.
pub trait Transaction: Send + Sync {
    fn mode(&self) -> TxMode;
    fn id(&self) -> TxId;
}

/// Every upsert and removal staged by one transaction.
///
/// Removals are applied after upserts, so a record both written and
/// removed in the same set ends up removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub entities: Vec<Entity>,
    pub memberships: Vec<Membership>,
    pub boundaries: Vec<Boundary>,
    pub removed_entities: Vec<EntityId>,
    pub removed_memberships: Vec<(NodeId, EntityId)>,
    pub removed_boundaries: Vec<(EntityId, EntityId)>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of staged operations.
    pub fn len(&self) -> usize {
        self.nodes.len()
            + self.links.len()
            + self.entities.len()
            + self.memberships.len()
            + self.boundaries.len()
            + self.removed_entities.len()
            + self.removed_memberships.len()
            + self.removed_boundaries.len()
    }
}
