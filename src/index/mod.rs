//! Membership index: both directions of the `BELONGS_TO` relation.
//!
//! Lookups answer "members of entity X" and "entities containing node Y".
//! Each posting list is kept sorted by id so iteration order is stable.

use hashbrown::HashMap;
use crate::model::{EntityId, Membership, NodeId};

#[derive(Debug, Clone, Default)]
pub struct MembershipIndex {
    by_entity: HashMap<EntityId, Vec<(NodeId, f64)>>,
    by_node: HashMap<NodeId, Vec<(EntityId, f64)>>,
}

fn upsert<K: Ord + Copy>(list: &mut Vec<(K, f64)>, key: K, weight: f64) {
    match list.binary_search_by(|(k, _)| k.cmp(&key)) {
        Ok(i) => list[i].1 = weight,
        Err(i) => list.insert(i, (key, weight)),
    }
}

fn remove<K: Ord + Copy>(list: &mut Vec<(K, f64)>, key: K) -> bool {
    match list.binary_search_by(|(k, _)| k.cmp(&key)) {
        Ok(i) => {
            list.remove(i);
            true
        }
        Err(_) => false,
    }
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_memberships<'a>(items: impl IntoIterator<Item = &'a Membership>) -> Self {
        let mut idx = Self::new();
        for m in items {
            idx.insert(m);
        }
        idx
    }

    /// Insert or re-weight one membership.
    pub fn insert(&mut self, m: &Membership) {
        upsert(self.by_entity.entry(m.entity).or_default(), m.node, m.weight);
        upsert(self.by_node.entry(m.node).or_default(), m.entity, m.weight);
    }

    /// Returns true if the membership existed.
    pub fn remove(&mut self, node: NodeId, entity: EntityId) -> bool {
        let removed = self
            .by_entity
            .get_mut(&entity)
            .is_some_and(|l| remove(l, node));
        if let Some(l) = self.by_node.get_mut(&node) {
            remove(l, entity);
            if l.is_empty() {
                self.by_node.remove(&node);
            }
        }
        if self.by_entity.get(&entity).is_some_and(|l| l.is_empty()) {
            self.by_entity.remove(&entity);
        }
        removed
    }

    /// Drop every membership of `entity`; returns the former members.
    pub fn remove_entity(&mut self, entity: EntityId) -> Vec<NodeId> {
        let members: Vec<NodeId> = self
            .by_entity
            .remove(&entity)
            .map(|l| l.into_iter().map(|(n, _)| n).collect())
            .unwrap_or_default();
        for n in &members {
            if let Some(l) = self.by_node.get_mut(n) {
                remove(l, entity);
                if l.is_empty() {
                    self.by_node.remove(n);
                }
            }
        }
        members
    }

    /// Members of an entity with raw weights, sorted by node id.
    pub fn members(&self, entity: EntityId) -> &[(NodeId, f64)] {
        self.by_entity.get(&entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entities containing a node with raw weights, sorted by entity id.
    pub fn entities_of(&self, node: NodeId) -> &[(EntityId, f64)] {
        self.by_node.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn weight(&self, node: NodeId, entity: EntityId) -> Option<f64> {
        let l = self.by_entity.get(&entity)?;
        l.binary_search_by(|(k, _)| k.cmp(&node)).ok().map(|i| l[i].1)
    }

    pub fn member_count(&self, entity: EntityId) -> usize {
        self.members(entity).len()
    }

    /// Member weights normalised to sum to one. Uniform when every weight is ~0.
    pub fn normalized_members(&self, entity: EntityId) -> Vec<(NodeId, f64)> {
        let members = self.members(entity);
        if members.is_empty() {
            return Vec::new();
        }
        let total: f64 = members.iter().map(|(_, w)| w.max(0.0)).sum();
        if total <= 1e-12 {
            let u = 1.0 / members.len() as f64;
            return members.iter().map(|(n, _)| (*n, u)).collect();
        }
        members.iter().map(|(n, w)| (*n, w.max(0.0) / total)).collect()
    }

    /// Number of members two entities share.
    pub fn overlap(&self, a: EntityId, b: EntityId) -> usize {
        let (la, lb) = (self.members(a), self.members(b));
        let (mut i, mut j, mut shared) = (0, 0, 0);
        while i < la.len() && j < lb.len() {
            match la[i].0.cmp(&lb[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    shared += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        shared
    }

    /// Every membership as an edge record, ordered by (entity, node).
    pub fn to_memberships(&self) -> Vec<Membership> {
        let mut entities: Vec<_> = self.by_entity.keys().copied().collect();
        entities.sort();
        entities
            .into_iter()
            .flat_map(|e| {
                self.members(e)
                    .iter()
                    .map(move |(n, w)| Membership::new(*n, e, *w))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx() -> MembershipIndex {
        MembershipIndex::from_memberships(&[
            Membership::new(NodeId(3), EntityId(1), 1.0),
            Membership::new(NodeId(1), EntityId(1), 3.0),
            Membership::new(NodeId(1), EntityId(2), 1.0),
            Membership::new(NodeId(2), EntityId(2), 1.0),
        ])
    }

    #[test]
    fn test_lookups_both_directions() {
        let idx = idx();
        assert_eq!(idx.members(EntityId(1)), &[(NodeId(1), 3.0), (NodeId(3), 1.0)]);
        assert_eq!(idx.entities_of(NodeId(1)), &[(EntityId(1), 3.0), (EntityId(2), 1.0)]);
        assert_eq!(idx.overlap(EntityId(1), EntityId(2)), 1);
    }

    #[test]
    fn test_normalized_members() {
        let idx = idx();
        let n = idx.normalized_members(EntityId(1));
        assert_eq!(n, vec![(NodeId(1), 0.75), (NodeId(3), 0.25)]);

        let mut zero = MembershipIndex::new();
        zero.insert(&Membership::new(NodeId(1), EntityId(9), 0.0));
        zero.insert(&Membership::new(NodeId(2), EntityId(9), 0.0));
        assert_eq!(zero.normalized_members(EntityId(9)), vec![(NodeId(1), 0.5), (NodeId(2), 0.5)]);
    }

    #[test]
    fn test_remove_entity_clears_reverse_postings() {
        let mut idx = idx();
        let former = idx.remove_entity(EntityId(2));
        assert_eq!(former, vec![NodeId(1), NodeId(2)]);
        assert!(idx.entities_of(NodeId(2)).is_empty());
        assert_eq!(idx.entities_of(NodeId(1)), &[(EntityId(1), 3.0)]);
        assert!(!idx.remove(NodeId(2), EntityId(2)));
    }
}
