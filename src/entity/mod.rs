//! # Entity Layer
//!
//! Entities are weighted aggregates over member nodes. Their runtime energy
//! is never stored independently: [`refresh_aggregates`] recomputes it from
//! member energies whenever node energy changes.
//!
//! ```text
//! energy_runtime    = Σ m̃_i · max(0, E_i − θ_i)
//! threshold_runtime = Σ m̃_i · θ_i · (1 − discount · quality)
//! ```
//!
//! `m̃` are membership weights normalised to sum to one per entity.
//! The lifecycle state machine lives in [`lifecycle`].

pub mod lifecycle;

use crate::model::{ActivationLevel, Embedding, EntityId, NodeId, cosine};
use crate::model::vector::weighted_mean;
use crate::working::WorkingGraph;

/// Recompute runtime energy, threshold, member count and activation level
/// for every entity from current member state.
pub fn refresh_aggregates(graph: &mut WorkingGraph, quality_discount: f64) {
    for id in graph.entity_ids() {
        refresh_entity(graph, id, quality_discount);
    }
}

pub fn refresh_entity(graph: &mut WorkingGraph, id: EntityId, quality_discount: f64) {
    let members = graph.memberships().normalized_members(id);
    let (mut energy, mut theta) = (0.0, 0.0);
    for (node_id, w) in &members {
        if let Some(n) = graph.node(*node_id) {
            energy += w * n.surplus();
            theta += w * n.threshold;
        }
    }
    let Some(entity) = graph.entity_mut(id) else { return };
    let quality = entity.quality_score.clamp(0.0, 1.0);
    entity.member_count = members.len();
    entity.energy_runtime = energy;
    entity.threshold_runtime = theta * (1.0 - quality_discount * quality);
    entity.activation_level_runtime = if entity.threshold_runtime > 0.0 {
        ActivationLevel::from_ratio(energy / entity.threshold_runtime)
    } else {
        ActivationLevel::Absent
    };
}

/// Membership-weighted mean of member embeddings.
pub fn member_centroid(graph: &WorkingGraph, id: EntityId) -> Option<Embedding> {
    let members = graph.memberships().normalized_members(id);
    weighted_mean(members.iter().filter_map(|(n, w)| {
        graph.node(*n).and_then(|node| node.embedding.as_deref()).map(|e| (e, *w))
    }))
}

/// Cluster tightness in [0, 1].
///
/// With member embeddings: mean `(cos + 1) / 2` of members against the
/// centroid. Without: density of links among members. Fewer than two
/// members is perfectly tight.
pub fn coherence(graph: &WorkingGraph, id: EntityId) -> f64 {
    let members: Vec<NodeId> = graph.memberships().members(id).iter().map(|(n, _)| *n).collect();
    if members.len() < 2 {
        return 1.0;
    }
    let centroid = graph
        .entity(id)
        .and_then(|e| e.centroid.clone())
        .or_else(|| member_centroid(graph, id));
    if let Some(c) = centroid {
        let sims: Vec<f64> = members
            .iter()
            .filter_map(|n| graph.node(*n)?.embedding.as_deref().and_then(|e| cosine(e, &c)))
            .collect();
        if sims.len() >= 2 {
            return sims.iter().map(|s| (s + 1.0) / 2.0).sum::<f64>() / sims.len() as f64;
        }
    }
    let internal = members
        .iter()
        .flat_map(|n| graph.out_links(*n).iter())
        .filter_map(|l| graph.link(*l))
        .filter(|l| members.binary_search(&l.target).is_ok())
        .count();
    let possible = members.len() * (members.len() - 1);
    (internal as f64 / possible as f64).min(1.0)
}

/// Bimodality coefficient `(γ² + 1) / κ` from population skewness and
/// kurtosis; `None` below four values or with zero variance. A uniform
/// sample sits near 5/9, any two-point sample at exactly 1.
pub fn bimodality_coefficient(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 4 {
        return None;
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for v in values {
        let d = v - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    m2 /= nf;
    m3 /= nf;
    m4 /= nf;
    if m2 <= 1e-12 {
        return None;
    }
    let skew = m3 / m2.powf(1.5);
    let kurtosis = m4 / (m2 * m2);
    Some((skew * skew + 1.0) / kurtosis)
}

/// Split a set of `(id, value)` pairs into a low and a high group at the
/// cut that maximises between-group variance. Both groups are non-empty
/// for inputs of two or more values; each group is sorted by id.
pub fn two_means_split<T: Copy + Ord>(items: &[(T, f64)]) -> (Vec<T>, Vec<T>) {
    let mut sorted: Vec<(T, f64)> = items.to_vec();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    if sorted.len() < 2 {
        return (sorted.into_iter().map(|(t, _)| t).collect(), Vec::new());
    }
    let total: f64 = sorted.iter().map(|(_, v)| v).sum();
    let n = sorted.len() as f64;
    let mut best = (f64::NEG_INFINITY, 1);
    let mut left_sum = 0.0;
    for cut in 1..sorted.len() {
        left_sum += sorted[cut - 1].1;
        let (nl, nr) = (cut as f64, n - cut as f64);
        let (ml, mr) = (left_sum / nl, (total - left_sum) / nr);
        let between = nl * nr * (ml - mr).powi(2);
        if between > best.0 {
            best = (between, cut);
        }
    }
    let (low, high) = sorted.split_at(best.1);
    let mut low: Vec<T> = low.iter().map(|(t, _)| *t).collect();
    let mut high: Vec<T> = high.iter().map(|(t, _)| *t).collect();
    low.sort();
    high.sort();
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::*;
    use crate::storage::GraphSnapshot;

    fn graph() -> WorkingGraph {
        WorkingGraph::from_snapshot(
            GraphSnapshot {
                nodes: vec![
                    Node::new(NodeId(1), "a").with_threshold(1.0).with_energy(3.0),
                    Node::new(NodeId(2), "b").with_threshold(3.0).with_energy(0.0),
                ],
                links: vec![Link::new(LinkId(1), NodeId(1), NodeId(2), "r")],
                entities: vec![Entity::new(EntityId(1), "pair", EntityKind::Functional)],
                memberships: vec![
                    Membership::new(NodeId(1), EntityId(1), 1.0),
                    Membership::new(NodeId(2), EntityId(1), 1.0),
                ],
                boundaries: vec![],
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_aggregate_uses_member_surplus() {
        let mut g = graph();
        refresh_aggregates(&mut g, 0.2);
        let e = g.entity(EntityId(1)).unwrap();
        // 0.5 * (3 - 1) + 0.5 * 0
        assert!((e.energy_runtime - 1.0).abs() < 1e-12);
        // 0.5 * 1 + 0.5 * 3, quality 0
        assert!((e.threshold_runtime - 2.0).abs() < 1e-12);
        assert_eq!(e.member_count, 2);
        assert_eq!(e.activation_level_runtime, ActivationLevel::Absent);
    }

    #[test]
    fn test_coherence_falls_back_to_link_density() {
        let g = graph();
        assert!((coherence(&g, EntityId(1)) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_bimodality_separates_shapes() {
        let bimodal = [0.0, 0.1, 0.0, 0.1, 5.0, 5.1, 5.0, 5.1];
        let unimodal = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let b = bimodality_coefficient(&bimodal).unwrap();
        let u = bimodality_coefficient(&unimodal).unwrap();
        assert!(b > 0.9, "two tight clusters should approach 1, got {b}");
        assert!(u < b);
        assert_eq!(bimodality_coefficient(&[1.0, 1.0, 1.0, 1.0]), None);
    }

    #[test]
    fn test_two_means_split() {
        let (low, high) = two_means_split(&[(4u64, 5.0), (1, 0.1), (3, 4.8), (2, 0.0)]);
        assert_eq!(low, vec![1, 2]);
        assert_eq!(high, vec![3, 4]);
    }
}
