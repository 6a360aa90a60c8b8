//! Phase 4: weight learning.
//!
//! The only writer of `log_weight` (nodes, links, entities) and
//! `ease_log_weight` (boundaries). Credit compounds sub-linearly through an
//! EMA in log space:
//!
//! ```text
//! lw' = (1 - η) · lw + η · ln(exp(lw) + credit)
//! ```
//!
//! Zero credit leaves the weight unchanged. Workspace members get credit 1;
//! links and boundaries that carried a payload get `scale · ema_flow_mag`.
//!
//! Also writes the presence, seat, activity and formation-quality EMAs.

use hashbrown::HashMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::model::*;
use crate::working::WorkingGraph;
use crate::Result;
use super::redistribution::RedistributionOutcome;
use super::workspace::Workspace;
use super::InvariantGuard;

/// EMAs below this are left alone for unselected nodes.
const PRESENCE_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearningOutcome {
    pub nodes_credited: usize,
    pub entities_credited: usize,
    pub links_credited: usize,
    pub boundaries_credited: usize,
}

/// One log-space learning step.
#[inline]
pub fn log_weight_step(lw: f64, credit: f64, rate: f64) -> f64 {
    if credit <= 0.0 {
        return lw;
    }
    (1.0 - rate) * lw + rate * (lw.exp() + credit).ln()
}

/// Run one learning pass.
///
/// `injected` lists this tick's stimulus allocations, summed per node.
pub fn learn(
    graph: &mut WorkingGraph,
    workspace: &Workspace,
    redistribution: &RedistributionOutcome,
    injected: &[(NodeId, f64)],
    cfg: &EngineConfig,
    guard: &mut InvariantGuard,
) -> Result<LearningOutcome> {
    let alpha = cfg.ema_alpha;
    let l = &cfg.learning;
    let mut out = LearningOutcome::default();

    let total_injected: f64 = injected.iter().map(|(_, e)| e).sum();
    let seats: HashMap<NodeId, f64> = if total_injected > 0.0 {
        injected.iter().map(|(n, e)| (*n, e / total_injected)).collect()
    } else {
        HashMap::new()
    };

    // Formation quality seen by a node: its best entity's quality.
    let node_quality: HashMap<NodeId, f64> = workspace
        .nodes()
        .map(|n| {
            let q = graph
                .memberships()
                .entities_of(n)
                .iter()
                .filter_map(|(e, _)| graph.entity(*e).map(|e| e.quality_score))
                .fold(0.0, f64::max);
            (n, q)
        })
        .collect();

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------
    let ids = graph.node_ids().to_vec();
    for id in ids {
        let selected = workspace.contains_node(id);
        let seat = seats.get(&id).copied();
        let Some(n) = graph.node_mut(id) else { continue };
        if selected {
            n.log_weight = guard.range(format_args!("{id}.log_weight"), log_weight_step(n.log_weight, 1.0, l.rate), f64::MIN, f64::MAX)?;
            let q = node_quality.get(&id).copied().unwrap_or(0.0);
            n.ema_formation_quality = guard.unit(format_args!("{id}.ema_formation_quality"), ema(n.ema_formation_quality, q, alpha))?;
            out.nodes_credited += 1;
        }
        if selected || n.ema_wm_presence > PRESENCE_FLOOR {
            let sample = if selected { 1.0 } else { 0.0 };
            n.ema_wm_presence = guard.unit(format_args!("{id}.ema_wm_presence"), ema(n.ema_wm_presence, sample, alpha))?;
        }
        if seat.is_some() || n.ema_trace_seats > PRESENCE_FLOOR {
            let sample = seat.unwrap_or(0.0);
            n.ema_trace_seats = guard.unit(format_args!("{id}.ema_trace_seats"), ema(n.ema_trace_seats, sample, alpha))?;
        }
    }

    // ------------------------------------------------------------------
    // Links and boundaries that carried payload
    // ------------------------------------------------------------------
    for &lid in &redistribution.touched_links {
        let Some(link) = graph.link_mut(lid) else { continue };
        let credit = l.link_credit_scale * link.trace.ema_flow_mag;
        link.log_weight = guard.range(format_args!("{lid}.log_weight"), log_weight_step(link.log_weight, credit, l.rate), f64::MIN, f64::MAX)?;
        out.links_credited += 1;
    }
    let mut carried: Vec<(EntityId, EntityId)> = redistribution.boundary_strides.iter().map(|b| b.boundary).collect();
    carried.sort();
    carried.dedup();
    for key in carried {
        let Some(b) = graph.boundary_mut(key) else { continue };
        let credit = l.boundary_credit_scale * b.ema_flow_mag;
        b.ease_log_weight = guard.range(format_args!("{}->{}.ease_log_weight", key.0, key.1), log_weight_step(b.ease_log_weight, credit, l.rate), f64::MIN, f64::MAX)?;
        out.boundaries_credited += 1;
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------
    for id in graph.entity_ids() {
        let selected = workspace.contains_entity(id);
        let seat: f64 = graph
            .memberships()
            .members(id)
            .iter()
            .filter_map(|(n, _)| seats.get(n))
            .sum();
        let Some(e) = graph.entity_mut(id) else { continue };
        if selected {
            e.log_weight = guard.range(format_args!("{id}.log_weight"), log_weight_step(e.log_weight, 1.0, l.rate), f64::MIN, f64::MAX)?;
            out.entities_credited += 1;
        }
        let active = if e.is_active() { 1.0 } else { 0.0 };
        e.ema_active = guard.unit(format_args!("{id}.ema_active"), ema(e.ema_active, active, alpha))?;
        e.ema_wm_presence = guard.unit(format_args!("{id}.ema_wm_presence"), ema(e.ema_wm_presence, if selected { 1.0 } else { 0.0 }, alpha))?;
        e.ema_trace_seats = guard.unit(format_args!("{id}.ema_trace_seats"), ema(e.ema_trace_seats, seat.min(1.0), alpha))?;
        e.ema_formation_quality = guard.unit(format_args!("{id}.ema_formation_quality"), ema(e.ema_formation_quality, e.quality_score, alpha))?;
    }

    debug!(
        nodes = out.nodes_credited,
        entities = out.entities_credited,
        links = out.links_credited,
        boundaries = out.boundaries_credited,
        "learning finished"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::config::InvariantMode;
    use crate::phases::workspace::WorkspaceItem;
    use crate::storage::GraphSnapshot;

    #[test]
    fn test_log_step_compounds_sublinearly() {
        let mut lw = 0.0;
        let mut gains = Vec::new();
        for _ in 0..5 {
            let next = log_weight_step(lw, 1.0, 0.1);
            gains.push(next - lw);
            lw = next;
        }
        assert!(gains.windows(2).all(|w| w[1] < w[0]), "{gains:?}");
        assert_eq!(log_weight_step(0.7, 0.0, 0.1), 0.7);
    }

    #[test]
    fn test_only_selected_and_loaded_records_learn() {
        let mut g = WorkingGraph::from_snapshot(
            GraphSnapshot {
                nodes: vec![Node::new(NodeId(1), "a"), Node::new(NodeId(2), "b")],
                links: vec![Link::new(LinkId(1), NodeId(1), NodeId(2), "r")],
                entities: vec![],
                memberships: vec![],
                boundaries: vec![],
            },
            Utc::now(),
        );
        let ws = Workspace { items: vec![WorkspaceItem::Node { id: NodeId(1), energy: 3.0 }] };
        let cfg = EngineConfig::default();
        let mut guard = InvariantGuard::new(InvariantMode::Strict);
        let out = learn(&mut g, &ws, &RedistributionOutcome::default(), &[(NodeId(2), 4.0)], &cfg, &mut guard).unwrap();

        assert_eq!(out.nodes_credited, 1);
        assert!(g.node(NodeId(1)).unwrap().log_weight > 0.0);
        assert_eq!(g.node(NodeId(2)).unwrap().log_weight, 0.0);
        assert!((g.node(NodeId(1)).unwrap().ema_wm_presence - 0.1).abs() < 1e-12);
        assert!((g.node(NodeId(2)).unwrap().ema_trace_seats - 0.1).abs() < 1e-12);
        assert_eq!(g.link(LinkId(1)).unwrap().log_weight, 0.0, "no payload, no credit");
    }
}
