//! Per-tick working copy.
//!
//! The engine loads one committed view of its instance into a
//! [`WorkingGraph`], runs every phase against it synchronously, and turns
//! the difference from the loaded baseline into a single [`WriteSet`].
//! Nodes and entities that changed get their version bumped exactly once.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;

use crate::index::MembershipIndex;
use crate::model::*;
use crate::storage::{Filter, GraphSnapshot, GraphStore};
use crate::tx::WriteSet;
use crate::Result;

/// Mutable in-memory view of one graph instance for the duration of a tick.
#[derive(Debug, Clone)]
pub struct WorkingGraph {
    tick_time: DateTime<Utc>,
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    links: HashMap<LinkId, Link>,
    link_order: Vec<LinkId>,
    out_links: HashMap<NodeId, Vec<LinkId>>,
    in_links: HashMap<NodeId, Vec<LinkId>>,
    entities: BTreeMap<EntityId, Entity>,
    memberships: MembershipIndex,
    boundaries: BTreeMap<(EntityId, EntityId), Boundary>,
    baseline: GraphSnapshot,
}

impl WorkingGraph {
    /// Read the instance's committed state as of one commit.
    pub async fn load<S: GraphStore + ?Sized>(
        store: &S,
        filter: &Filter,
        tick_time: DateTime<Utc>,
    ) -> Result<Self> {
        let snapshot = store.snapshot(filter).await?;
        Ok(Self::from_snapshot(snapshot, tick_time))
    }

    pub fn from_snapshot(snapshot: GraphSnapshot, tick_time: DateTime<Utc>) -> Self {
        let mut nodes = HashMap::with_capacity(snapshot.nodes.len());
        let mut node_order = Vec::with_capacity(snapshot.nodes.len());
        for n in &snapshot.nodes {
            node_order.push(n.id);
            nodes.insert(n.id, n.clone());
        }
        node_order.sort();

        let mut links = HashMap::with_capacity(snapshot.links.len());
        let mut link_order = Vec::with_capacity(snapshot.links.len());
        let mut out_links: HashMap<NodeId, Vec<LinkId>> = HashMap::new();
        let mut in_links: HashMap<NodeId, Vec<LinkId>> = HashMap::new();
        let mut sorted_links: Vec<&Link> = snapshot.links.iter().collect();
        sorted_links.sort_by_key(|l| l.id);
        for l in sorted_links {
            // Links whose endpoints fall outside the instance are not ours to move.
            if !nodes.contains_key(&l.source) || !nodes.contains_key(&l.target) {
                continue;
            }
            link_order.push(l.id);
            out_links.entry(l.source).or_default().push(l.id);
            in_links.entry(l.target).or_default().push(l.id);
            links.insert(l.id, l.clone());
        }

        let entities: BTreeMap<EntityId, Entity> =
            snapshot.entities.iter().map(|e| (e.id, e.clone())).collect();
        let memberships = MembershipIndex::from_memberships(
            snapshot
                .memberships
                .iter()
                .filter(|m| nodes.contains_key(&m.node) && entities.contains_key(&m.entity)),
        );
        let boundaries = snapshot
            .boundaries
            .iter()
            .filter(|b| entities.contains_key(&b.source) && entities.contains_key(&b.target))
            .map(|b| (b.key(), b.clone()))
            .collect();

        Self {
            tick_time,
            nodes,
            node_order,
            links,
            link_order,
            out_links,
            in_links,
            entities,
            memberships,
            boundaries,
            baseline: snapshot,
        }
    }

    pub fn tick_time(&self) -> DateTime<Utc> {
        self.tick_time
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_order
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn total_energy(&self) -> f64 {
        self.nodes.values().map(|n| n.energy).sum()
    }

    pub fn active_node_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_active()).count()
    }

    // ========================================================================
    // Links
    // ========================================================================

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn link_ids(&self) -> &[LinkId] {
        &self.link_order
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> + '_ {
        self.link_order.iter().filter_map(|id| self.links.get(id))
    }

    pub fn link_count(&self) -> usize {
        self.link_order.len()
    }

    /// Links leaving `node`, in id order.
    pub fn out_links(&self, node: NodeId) -> &[LinkId] {
        self.out_links.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Links entering `node`, in id order.
    pub fn in_links(&self, node: NodeId) -> &[LinkId] {
        self.in_links.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    // ========================================================================
    // Entities, memberships, boundaries
    // ========================================================================

    pub fn has_entities(&self) -> bool {
        !self.entities.is_empty()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Entities in ascending id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.values()
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> + '_ {
        self.entities.values_mut()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn insert_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    /// Remove an entity with its memberships and boundaries. Member nodes stay.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let removed = self.entities.remove(&id)?;
        self.memberships.remove_entity(id);
        self.boundaries.retain(|(s, t), _| *s != id && *t != id);
        Some(removed)
    }

    pub fn memberships(&self) -> &MembershipIndex {
        &self.memberships
    }

    pub fn memberships_mut(&mut self) -> &mut MembershipIndex {
        &mut self.memberships
    }

    pub fn boundaries(&self) -> impl Iterator<Item = &Boundary> + '_ {
        self.boundaries.values()
    }

    pub fn boundary(&self, key: (EntityId, EntityId)) -> Option<&Boundary> {
        self.boundaries.get(&key)
    }

    pub fn boundary_mut(&mut self, key: (EntityId, EntityId)) -> Option<&mut Boundary> {
        self.boundaries.get_mut(&key)
    }

    pub fn boundaries_mut(&mut self) -> impl Iterator<Item = &mut Boundary> + '_ {
        self.boundaries.values_mut()
    }

    pub fn insert_boundary(&mut self, boundary: Boundary) {
        self.boundaries.insert(boundary.key(), boundary);
    }

    pub fn remove_boundary(&mut self, key: (EntityId, EntityId)) -> Option<Boundary> {
        self.boundaries.remove(&key)
    }

    /// Boundaries leaving `entity`, ordered by target id.
    pub fn outgoing_boundaries(&self, entity: EntityId) -> Vec<(EntityId, EntityId)> {
        self.boundaries
            .range((entity, EntityId(0))..=(entity, EntityId(u64::MAX)))
            .map(|(k, _)| *k)
            .collect()
    }

    // ========================================================================
    // Write-back
    // ========================================================================

    /// Everything that differs from the loaded baseline, as one write set.
    pub fn write_set(&self) -> WriteSet {
        let mut w = WriteSet::default();

        let base_nodes: HashMap<NodeId, &Node> =
            self.baseline.nodes.iter().map(|n| (n.id, n)).collect();
        for n in self.nodes() {
            match base_nodes.get(&n.id) {
                Some(old) if *old == n => {}
                Some(old) => {
                    let mut n = n.clone();
                    n.version = old.version + 1;
                    w.nodes.push(n);
                }
                None => w.nodes.push(n.clone()),
            }
        }

        let base_links: HashMap<LinkId, &Link> =
            self.baseline.links.iter().map(|l| (l.id, l)).collect();
        for l in self.links() {
            if base_links.get(&l.id).is_none_or(|old| *old != l) {
                w.links.push(l.clone());
            }
        }

        let base_entities: HashMap<EntityId, &Entity> =
            self.baseline.entities.iter().map(|e| (e.id, e)).collect();
        for e in self.entities.values() {
            match base_entities.get(&e.id) {
                Some(old) if *old == e => {}
                Some(old) => {
                    let mut e = e.clone();
                    e.version = old.version + 1;
                    w.entities.push(e);
                }
                None => w.entities.push(e.clone()),
            }
        }
        for old in &self.baseline.entities {
            if !self.entities.contains_key(&old.id) {
                w.removed_entities.push(old.id);
            }
        }

        let current = self.memberships.to_memberships();
        let current_keys: HashMap<(NodeId, EntityId), f64> =
            current.iter().map(|m| (m.key(), m.weight)).collect();
        let base_keys: HashMap<(NodeId, EntityId), f64> =
            self.baseline.memberships.iter().map(|m| (m.key(), m.weight)).collect();
        for m in current {
            if base_keys.get(&m.key()) != Some(&m.weight) {
                w.memberships.push(m);
            }
        }
        for m in &self.baseline.memberships {
            if !current_keys.contains_key(&m.key()) && self.entities.contains_key(&m.entity) {
                w.removed_memberships.push(m.key());
            }
        }

        let base_boundaries: HashMap<(EntityId, EntityId), &Boundary> =
            self.baseline.boundaries.iter().map(|b| (b.key(), b)).collect();
        for b in self.boundaries.values() {
            if base_boundaries.get(&b.key()).is_none_or(|old| *old != b) {
                w.boundaries.push(b.clone());
            }
        }
        for b in &self.baseline.boundaries {
            let live = self.entities.contains_key(&b.source) && self.entities.contains_key(&b.target);
            if live && !self.boundaries.contains_key(&b.key()) {
                w.removed_boundaries.push(b.key());
            }
        }

        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> GraphSnapshot {
        GraphSnapshot {
            nodes: vec![
                Node::new(NodeId(2), "b"),
                Node::new(NodeId(1), "a").with_energy(3.0),
            ],
            links: vec![
                Link::new(LinkId(1), NodeId(1), NodeId(2), "r"),
                Link::new(LinkId(2), NodeId(1), NodeId(99), "outside"),
            ],
            entities: vec![Entity::new(EntityId(1), "topic", EntityKind::Semantic)],
            memberships: vec![Membership::new(NodeId(1), EntityId(1), 1.0)],
            boundaries: vec![],
        }
    }

    #[test]
    fn test_unchanged_graph_writes_nothing() {
        let g = WorkingGraph::from_snapshot(snapshot(), Utc::now());
        assert!(g.write_set().is_empty());
        assert_eq!(g.node_ids(), &[NodeId(1), NodeId(2)]);
        assert_eq!(g.out_links(NodeId(1)), &[LinkId(1)], "dangling link is skipped");
    }

    #[test]
    fn test_changed_node_gets_version_bump() {
        let mut g = WorkingGraph::from_snapshot(snapshot(), Utc::now());
        g.node_mut(NodeId(1)).unwrap().energy = 1.0;
        let w = g.write_set();
        assert_eq!(w.nodes.len(), 1);
        assert_eq!(w.nodes[0].version, 1);
        assert_eq!(w.nodes[0].energy, 1.0);
    }

    #[test]
    fn test_removed_entity_is_reported_once() {
        let mut g = WorkingGraph::from_snapshot(snapshot(), Utc::now());
        g.remove_entity(EntityId(1));
        let w = g.write_set();
        assert_eq!(w.removed_entities, vec![EntityId(1)]);
        assert!(w.removed_memberships.is_empty(), "store cascades memberships of removed entities");
        assert!(g.memberships().entities_of(NodeId(1)).is_empty());
    }
}
