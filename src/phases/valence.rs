//! Seven-hunger valence for a prospective stride.
//!
//! Each hunger scores the stride in [0, 1] from the link and its two
//! endpoints; [`GateVector::from_scores`] weights and normalises them.
//! Signals that cannot be computed (no embedding, no entities) score a
//! neutral 0.5.

use crate::model::*;
use crate::working::WorkingGraph;

const NEUTRAL: f64 = 0.5;

fn unit_cosine(a: Option<&[f32]>, b: Option<&[f32]>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => cosine(a, b).map_or(NEUTRAL, |c| (c + 1.0) / 2.0),
        _ => NEUTRAL,
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Centroid of the entity `node` belongs to most strongly.
fn primary_centroid(graph: &WorkingGraph, node: NodeId) -> Option<&[f32]> {
    graph
        .memberships()
        .entities_of(node)
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .and_then(|(e, _)| graph.entity(*e))
        .and_then(|e| e.centroid.as_deref())
}

/// `1 - |A ∩ B| / |A ∪ B|` over the entity sets of two nodes.
fn entity_distance(graph: &WorkingGraph, a: NodeId, b: NodeId) -> f64 {
    let ea = graph.memberships().entities_of(a);
    let eb = graph.memberships().entities_of(b);
    if ea.is_empty() && eb.is_empty() {
        return NEUTRAL;
    }
    let shared = ea.iter().filter(|(e, _)| eb.iter().any(|(o, _)| o == e)).count();
    let union = ea.len() + eb.len() - shared;
    1.0 - shared as f64 / union as f64
}

/// Raw hunger scores for moving energy along `link` in direction `dir`.
pub fn hunger_scores(graph: &WorkingGraph, link: &Link, dir: StrideDirection) -> [f64; HUNGER_COUNT] {
    let (from, to) = (link.from_node(dir), link.to_node(dir));
    let (Some(src), Some(tgt)) = (graph.node(from), graph.node(to)) else {
        return [NEUTRAL; HUNGER_COUNT];
    };
    let mut s = [0.0; HUNGER_COUNT];
    s[Hunger::Coherence.index()] = unit_cosine(src.embedding.as_deref(), tgt.embedding.as_deref());
    s[Hunger::Identity.index()] = unit_cosine(tgt.embedding.as_deref(), primary_centroid(graph, from));
    s[Hunger::Integration.index()] = entity_distance(graph, from, to);
    s[Hunger::Competence.index()] = 1.0 - (-link.effective_weight()).exp();
    s[Hunger::Surprise.index()] = 1.0 - link.trace.ema_active.clamp(0.0, 1.0);
    let gap = tgt.gap();
    s[Hunger::Control.index()] = gap / (src.surplus() + gap + f64::EPSILON);
    s[Hunger::Belonging.index()] = sigmoid(tgt.log_weight);
    s
}

/// Raw hunger scores for a boundary stride between two entities.
pub fn boundary_scores(graph: &WorkingGraph, boundary: &Boundary) -> [f64; HUNGER_COUNT] {
    let (Some(src), Some(tgt)) = (graph.entity(boundary.source), graph.entity(boundary.target)) else {
        return [NEUTRAL; HUNGER_COUNT];
    };
    let shared = graph.memberships().overlap(src.id, tgt.id);
    let union = (src.member_count + tgt.member_count).saturating_sub(shared);
    let gap = (tgt.threshold_runtime - tgt.energy_runtime).max(0.0);

    let mut s = [0.0; HUNGER_COUNT];
    s[Hunger::Coherence.index()] = unit_cosine(src.centroid.as_deref(), tgt.centroid.as_deref());
    s[Hunger::Identity.index()] = src.coherence_ema.clamp(0.0, 1.0);
    s[Hunger::Integration.index()] = if union == 0 { NEUTRAL } else { 1.0 - shared as f64 / union as f64 };
    s[Hunger::Competence.index()] = 1.0 - (-boundary.ease()).exp();
    s[Hunger::Surprise.index()] = 1.0 - tgt.ema_active.clamp(0.0, 1.0);
    s[Hunger::Control.index()] = gap / (src.surplus() + gap + f64::EPSILON);
    s[Hunger::Belonging.index()] = sigmoid(tgt.log_weight);
    s
}

/// Normalised gate vector for a stride.
pub fn gates(graph: &WorkingGraph, link: &Link, dir: StrideDirection, weights: &[f64; HUNGER_COUNT]) -> GateVector {
    GateVector::from_scores(hunger_scores(graph, link, dir), weights)
}
