//! Phase 3: workspace selection.
//!
//! Pure read of the working copy. Active entities are ranked by
//!
//! ```text
//! score = energy_runtime / token_cost · exp(z)
//! token_cost = base + member_cost · min(members_per_entity, member_count)
//! z = (log_weight - mean) / std   over all entities, 0 when std = 0
//! ```
//!
//! Each selected entity is followed by its highest-energy members, then the
//! highest-flow boundaries around the selection are listed. If that leaves
//! fewer than `min_items`, the highest-energy active nodes fill the gap.
//! Ties always break by id, so identical state gives identical output.

use serde::{Deserialize, Serialize};

use crate::config::WorkspaceConfig;
use crate::model::*;
use crate::working::WorkingGraph;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WorkspaceItem {
    Entity { id: EntityId, score: f64 },
    Node { id: NodeId, energy: f64 },
    Boundary { source: EntityId, target: EntityId, flow: f64 },
}

/// Ordered, bounded selection for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub items: Vec<WorkspaceItem>,
}

impl Workspace {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.items.iter().filter_map(|i| match i {
            WorkspaceItem::Entity { id, .. } => Some(*id),
            _ => None,
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.items.iter().filter_map(|i| match i {
            WorkspaceItem::Node { id, .. } => Some(*id),
            _ => None,
        })
    }

    pub fn boundaries(&self) -> impl Iterator<Item = (EntityId, EntityId)> + '_ {
        self.items.iter().filter_map(|i| match i {
            WorkspaceItem::Boundary { source, target, .. } => Some((*source, *target)),
            _ => None,
        })
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes().any(|n| n == id)
    }

    pub fn contains_entity(&self, id: EntityId) -> bool {
        self.entities().any(|e| e == id)
    }
}

pub fn token_cost(entity: &Entity, cfg: &WorkspaceConfig) -> f64 {
    cfg.base_token_cost + cfg.member_token_cost * entity.member_count.min(cfg.members_per_entity) as f64
}

/// Active entities with their selection score, best first.
pub fn entity_scores(graph: &WorkingGraph, cfg: &WorkspaceConfig) -> Vec<(EntityId, f64)> {
    let weights: Vec<f64> = graph.entities().map(|e| e.log_weight).collect();
    let n = weights.len().max(1) as f64;
    let mean = weights.iter().sum::<f64>() / n;
    let std = (weights.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / n).sqrt();

    let mut scored: Vec<(EntityId, f64)> = graph
        .entities()
        .filter(|e| e.is_active())
        .map(|e| {
            let z = if std > 1e-12 { (e.log_weight - mean) / std } else { 0.0 };
            let cost = token_cost(e, cfg).max(f64::EPSILON);
            (e.id, e.energy_runtime / cost * z.exp())
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
}

/// Select this tick's workspace.
pub fn select(graph: &WorkingGraph, cfg: &WorkspaceConfig) -> Workspace {
    let mut items: Vec<WorkspaceItem> = Vec::new();
    let mut nodes: Vec<NodeId> = Vec::new();
    let mut chosen: Vec<EntityId> = Vec::new();

    for (id, score) in entity_scores(graph, cfg) {
        if items.len() >= cfg.max_items {
            break;
        }
        items.push(WorkspaceItem::Entity { id, score });
        chosen.push(id);

        let mut members: Vec<(NodeId, f64)> = graph
            .memberships()
            .members(id)
            .iter()
            .filter_map(|(n, _)| graph.node(*n).map(|node| (*n, node.energy)))
            .filter(|(n, e)| *e > 0.0 && !nodes.contains(n))
            .collect();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        for (n, energy) in members.into_iter().take(cfg.members_per_entity) {
            items.push(WorkspaceItem::Node { id: n, energy });
            nodes.push(n);
        }
    }

    let mut boundaries: Vec<&Boundary> = graph
        .boundaries()
        .filter(|b| b.ema_flow_mag > 0.0)
        .filter(|b| chosen.contains(&b.source) || chosen.contains(&b.target))
        .collect();
    boundaries.sort_by(|a, b| b.ema_flow_mag.total_cmp(&a.ema_flow_mag).then(a.key().cmp(&b.key())));
    for b in boundaries.into_iter().take(cfg.boundary_links) {
        items.push(WorkspaceItem::Boundary { source: b.source, target: b.target, flow: b.ema_flow_mag });
    }

    if items.len() < cfg.min_items {
        let mut fill: Vec<&Node> = graph.nodes().filter(|n| n.is_active() && !nodes.contains(&n.id)).collect();
        fill.sort_by(|a, b| b.energy.total_cmp(&a.energy).then(a.id.cmp(&b.id)));
        let room = cfg.min_items - items.len();
        for n in fill.into_iter().take(room) {
            items.push(WorkspaceItem::Node { id: n.id, energy: n.energy });
        }
    }

    items.truncate(cfg.max_items);
    Workspace { items }
}
