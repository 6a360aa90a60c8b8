//! Entity lifecycle: quality scoring and state transitions.
//!
//! Runs once per tick after learning, in two steps:
//!
//! 1. [`evaluate`] updates structural state (coherence, centroid), scores
//!    quality, advances the sustained-window streaks and decides which
//!    transitions fire. It allocates nothing.
//! 2. [`apply`] rewrites entities, memberships and boundaries. Splits need
//!    fresh entity ids, which the caller allocates between the two steps.
//!
//! ```text
//! candidate ──▶ provisional ──▶ mature
//!     │              │            │
//!     └──── merge / split / dissolve (any stage) ────┘
//! ```
//!
//! Promotion needs quality strictly above the cohort median (candidate) or
//! 75th percentile (provisional). Dissolution and maturity also wait for the
//! entity to reach [`LifecycleConfig::min_dissolve_age`] and
//! [`LifecycleConfig::min_mature_age`] ticks, so fresh split children can warm
//! their EMAs up first.
//!
//! When several transitions apply to one entity the first in
//! [`LifecycleConfig::priority`] wins; the rest are dropped and logged.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{LifecycleConfig, TransitionKind};
use crate::model::*;
use crate::model::vector::{ema_embedding, weighted_mean};
use crate::working::WorkingGraph;
use super::{bimodality_coefficient, coherence, member_centroid, refresh_aggregates, two_means_split};

/// Floor applied to each sub-score before the geometric mean.
pub const QUALITY_FLOOR: f64 = 0.01;

/// The five normalised quality inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySignals {
    pub stability: f64,
    pub coherence: f64,
    pub distinctiveness: f64,
    pub utility: f64,
    pub evidence: f64,
}

impl QualitySignals {
    /// Geometric mean of the five signals, each clipped to `[QUALITY_FLOOR, 1]`.
    pub fn score(&self) -> f64 {
        let parts = [self.stability, self.coherence, self.distinctiveness, self.utility, self.evidence];
        let log_sum: f64 = parts
            .iter()
            .map(|p| if p.is_finite() { p.clamp(QUALITY_FLOOR, 1.0) } else { QUALITY_FLOOR }.ln())
            .sum();
        (log_sum / parts.len() as f64).exp()
    }
}

/// Where an entity ended up after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "entity")]
pub enum EntityFate {
    Provisional,
    Mature,
    Dissolved,
    /// Absorbed into the given survivor.
    MergedInto(EntityId),
    /// Shed part of its members into the given new entity.
    SplitInto(EntityId),
}

/// A decided, not yet applied, transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Promote { entity: EntityId, to: StabilityState },
    Dissolve { entity: EntityId },
    Merge { survivor: EntityId, absorbed: EntityId },
    Split { entity: EntityId, moved: Vec<NodeId> },
}

/// Output of [`evaluate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecyclePlan {
    pub actions: Vec<Action>,
    /// Entities that met more than one transition this tick.
    pub ambiguities: usize,
}

impl LifecyclePlan {
    /// Number of fresh entity ids [`apply`] will consume.
    pub fn ids_needed(&self) -> usize {
        self.actions.iter().filter(|a| matches!(a, Action::Split { .. })).count()
    }
}

/// One applied transition, as reported on the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub entity: EntityId,
    pub from: StabilityState,
    pub to: EntityFate,
    pub quality: f64,
}

// ============================================================================
// Evaluation
// ============================================================================

/// Linear-interpolated percentile of an unsorted sample, `q` in [0, 1].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (v.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    v[lo] + (v[hi] - v[lo]) * (pos - lo as f64)
}

fn distinctiveness(graph: &WorkingGraph, id: EntityId) -> f64 {
    let Some(own) = graph.entity(id).and_then(|e| e.centroid.as_deref()) else {
        return 0.5;
    };
    graph
        .entities()
        .filter(|e| e.id != id)
        .filter_map(|e| e.centroid.as_deref().and_then(|c| cosine(own, c)))
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
        .map_or(1.0, |max_sim| 1.0 - max_sim.max(0.0))
}

/// Score every entity, advance streaks and decide transitions.
pub fn evaluate(graph: &mut WorkingGraph, cfg: &LifecycleConfig, alpha: f64) -> LifecyclePlan {
    let ids = graph.entity_ids();

    // Structure first: centroids feed distinctiveness of every other entity.
    for &id in &ids {
        let c = coherence(graph, id);
        let centroid = member_centroid(graph, id);
        if let Some(e) = graph.entity_mut(id) {
            e.frames_since_creation += 1;
            e.coherence_ema = ema(e.coherence_ema, c, alpha);
            if let Some(sample) = centroid {
                e.centroid = Some(ema_embedding(e.centroid.as_deref(), &sample, alpha));
            }
        }
    }

    let mut qualities = Vec::with_capacity(ids.len());
    for &id in &ids {
        let distinct = distinctiveness(graph, id);
        let Some(e) = graph.entity(id) else { continue };
        let q = QualitySignals {
            stability: e.ema_active,
            coherence: e.coherence_ema,
            distinctiveness: distinct,
            utility: e.ema_wm_presence,
            evidence: e.ema_trace_seats,
        }
        .score();
        qualities.push((id, q));
    }
    let scores: Vec<f64> = qualities.iter().map(|(_, q)| *q).collect();
    let median = percentile(&scores, 0.5);
    let p75 = percentile(&scores, 0.75);

    let mut eligible: Vec<(EntityId, Vec<TransitionKind>)> = Vec::new();
    let mut split_groups: Vec<(EntityId, Vec<NodeId>)> = Vec::new();
    for &(id, q) in &qualities {
        let energies: Vec<(NodeId, f64)> = graph
            .memberships()
            .members(id)
            .iter()
            .filter_map(|(n, _)| graph.node(*n).map(|node| (*n, node.energy)))
            .collect();
        let values: Vec<f64> = energies.iter().map(|(_, e)| *e).collect();
        let bimodal = energies.len() >= cfg.split_min_members
            && bimodality_coefficient(&values).is_some_and(|bc| bc >= cfg.split_bimodality);

        let Some(e) = graph.entity_mut(id) else { continue };
        e.quality_score = q;
        let s = &mut e.streaks;
        // Strict: in a cohort without spread, a lone entity included, nobody exceeds.
        s.above_median = if q > median { s.above_median + 1 } else { 0 };
        s.above_p75 = if q > p75 { s.above_p75 + 1 } else { 0 };
        s.below_low_water = if q < cfg.low_water { s.below_low_water + 1 } else { 0 };
        s.bimodal = if bimodal { s.bimodal + 1 } else { 0 };

        let mut kinds = Vec::new();
        let age = e.frames_since_creation;
        if s.below_low_water >= cfg.dissolve_window && age >= cfg.min_dissolve_age {
            kinds.push(TransitionKind::Dissolve);
        }
        if s.bimodal >= cfg.split_window {
            let (low, high) = two_means_split(&energies);
            if low.len() >= 2 && high.len() >= 2 {
                kinds.push(TransitionKind::Split);
                split_groups.push((id, low));
            }
        }
        let promote = match e.stability_state {
            StabilityState::Candidate => s.above_median >= cfg.promote_window,
            StabilityState::Provisional => s.above_p75 >= cfg.mature_window && age >= cfg.min_mature_age,
            StabilityState::Mature => false,
        };
        if promote {
            kinds.push(TransitionKind::Promote);
        }
        eligible.push((id, kinds));
    }

    // Merge eligibility is pairwise.
    let mut merge_partners: Vec<(EntityId, EntityId, f64)> = Vec::new();
    for (i, &a) in ids.iter().enumerate() {
        for &b in &ids[i + 1..] {
            let (Some(ea), Some(eb)) = (graph.entity(a), graph.entity(b)) else { continue };
            let (Some(ca), Some(cb)) = (ea.centroid.as_deref(), eb.centroid.as_deref()) else { continue };
            let Some(sim) = cosine(ca, cb) else { continue };
            let smaller = ea.member_count.min(eb.member_count);
            if smaller == 0 || sim < cfg.merge_centroid_similarity {
                continue;
            }
            let overlap = graph.memberships().overlap(a, b) as f64 / smaller as f64;
            if overlap >= cfg.merge_overlap {
                merge_partners.push((a, b, sim));
            }
        }
    }
    for (id, kinds) in eligible.iter_mut() {
        if merge_partners.iter().any(|(a, b, _)| a == id || b == id) {
            kinds.push(TransitionKind::Merge);
        }
    }

    let rank = |k: &TransitionKind| cfg.priority.iter().position(|p| p == k).unwrap_or(usize::MAX);
    for (_, kinds) in eligible.iter_mut() {
        kinds.sort_by_key(|k| rank(k));
    }
    let kinds_of = |id: EntityId| -> &[TransitionKind] {
        eligible.iter().find(|(e, _)| *e == id).map(|(_, k)| k.as_slice()).unwrap_or(&[])
    };

    let mut plan = LifecyclePlan::default();
    let mut consumed: Vec<EntityId> = Vec::new();
    for (id, kinds) in &eligible {
        if kinds.len() > 1 {
            plan.ambiguities += 1;
            warn!(entity = %id, candidates = ?kinds, winner = ?kinds[0], "conflicting lifecycle transitions");
        }
        if consumed.contains(id) {
            continue;
        }
        for kind in kinds {
            let action = match kind {
                TransitionKind::Dissolve => Some(Action::Dissolve { entity: *id }),
                TransitionKind::Split => split_groups
                    .iter()
                    .find(|(e, _)| e == id)
                    .map(|(_, low)| Action::Split { entity: *id, moved: low.clone() }),
                TransitionKind::Promote => graph.entity(*id).map(|e| Action::Promote {
                    entity: *id,
                    to: match e.stability_state {
                        StabilityState::Candidate => StabilityState::Provisional,
                        _ => StabilityState::Mature,
                    },
                }),
                TransitionKind::Merge => {
                    // Best partner not already taken and not bound to a higher-priority transition.
                    let partner = merge_partners
                        .iter()
                        .filter_map(|(a, b, sim)| {
                            let other = if a == id { *b } else if b == id { *a } else { return None };
                            Some((other, *sim))
                        })
                        .filter(|(other, _)| !consumed.contains(other))
                        .filter(|(other, _)| {
                            kinds_of(*other).first().is_none_or(|k| rank(k) >= rank(&TransitionKind::Merge))
                        })
                        .max_by(|x, y| x.1.total_cmp(&y.1).then(y.0.cmp(&x.0)));
                    partner.and_then(|(other, _)| {
                        let qa = graph.entity(*id)?.quality_score;
                        let qb = graph.entity(other)?.quality_score;
                        let (survivor, absorbed) =
                            if qa > qb || (qa == qb && *id < other) { (*id, other) } else { (other, *id) };
                        consumed.push(other);
                        Some(Action::Merge { survivor, absorbed })
                    })
                }
            };
            if let Some(action) = action {
                consumed.push(*id);
                plan.actions.push(action);
                break;
            }
        }
    }
    plan
}

// ============================================================================
// Application
// ============================================================================

/// Apply a plan. `new_ids` must yield at least [`LifecyclePlan::ids_needed`] ids.
pub fn apply(
    graph: &mut WorkingGraph,
    plan: LifecyclePlan,
    new_ids: &mut impl Iterator<Item = EntityId>,
    quality_discount: f64,
) -> Vec<TransitionRecord> {
    let mut records = Vec::with_capacity(plan.actions.len());
    for action in plan.actions {
        match action {
            Action::Promote { entity, to } => {
                let Some(e) = graph.entity_mut(entity) else { continue };
                let from = e.stability_state;
                e.stability_state = to;
                info!(entity = %entity, %from, %to, quality = e.quality_score, "entity promoted");
                records.push(TransitionRecord {
                    entity,
                    from,
                    to: match to {
                        StabilityState::Mature => EntityFate::Mature,
                        _ => EntityFate::Provisional,
                    },
                    quality: e.quality_score,
                });
            }
            Action::Dissolve { entity } => {
                let Some(e) = graph.remove_entity(entity) else { continue };
                info!(entity = %entity, quality = e.quality_score, members = e.member_count, "entity dissolved");
                records.push(TransitionRecord {
                    entity,
                    from: e.stability_state,
                    to: EntityFate::Dissolved,
                    quality: e.quality_score,
                });
            }
            Action::Merge { survivor, absorbed } => {
                if let Some(record) = merge(graph, survivor, absorbed) {
                    records.push(record);
                }
            }
            Action::Split { entity, moved } => {
                let Some(new_id) = new_ids.next() else {
                    warn!(entity = %entity, "no entity id reserved for split, skipping");
                    continue;
                };
                if let Some(record) = split(graph, entity, &moved, new_id) {
                    records.push(record);
                }
            }
        }
    }
    refresh_aggregates(graph, quality_discount);
    records
}

fn merge(graph: &mut WorkingGraph, survivor: EntityId, absorbed: EntityId) -> Option<TransitionRecord> {
    let gone = graph.entity(absorbed)?.clone();
    let kept_count = graph.entity(survivor)?.member_count;

    for (node, w) in graph.memberships().members(absorbed).to_vec() {
        let weight = graph.memberships().weight(node, survivor).map_or(w, |old| old.max(w));
        graph.memberships_mut().insert(&Membership::new(node, survivor, weight));
    }
    let rewired: Vec<Boundary> = graph
        .boundaries()
        .filter(|b| b.source == absorbed || b.target == absorbed)
        .cloned()
        .collect();
    for mut b in rewired {
        if b.source == absorbed {
            b.source = survivor;
        }
        if b.target == absorbed {
            b.target = survivor;
        }
        if b.source == b.target {
            continue;
        }
        let keep = graph.boundary(b.key()).is_none_or(|old| old.ease_log_weight < b.ease_log_weight);
        if keep {
            graph.insert_boundary(b);
        }
    }

    let centroid = match (graph.entity(survivor)?.centroid.as_deref(), gone.centroid.as_deref()) {
        (Some(a), Some(b)) => weighted_mean([
            (a, kept_count.max(1) as f64),
            (b, gone.member_count.max(1) as f64),
        ]),
        (Some(a), None) => Some(a.to_vec()),
        (None, b) => b.map(<[f32]>::to_vec),
    };
    graph.remove_entity(absorbed);
    if let Some(e) = graph.entity_mut(survivor) {
        e.centroid = centroid;
    }
    info!(survivor = %survivor, absorbed = %absorbed, "entities merged");
    Some(TransitionRecord {
        entity: absorbed,
        from: gone.stability_state,
        to: EntityFate::MergedInto(survivor),
        quality: gone.quality_score,
    })
}

fn split(graph: &mut WorkingGraph, entity: EntityId, moved: &[NodeId], new_id: EntityId) -> Option<TransitionRecord> {
    let parent = graph.entity(entity)?.clone();
    let mut child = Entity::new(new_id, format!("{}/split", parent.name), parent.kind)
        .with_origin(EntityOrigin::Split, "lifecycle");
    child.scope = parent.scope.clone();
    graph.insert_entity(child);

    for node in moved {
        let Some(w) = graph.memberships().weight(*node, entity) else { continue };
        graph.memberships_mut().remove(*node, entity);
        graph.memberships_mut().insert(&Membership::new(*node, new_id, w));
    }
    graph.insert_boundary(Boundary::new(entity, new_id));
    graph.insert_boundary(Boundary::new(new_id, entity));

    let child_centroid = member_centroid(graph, new_id);
    let parent_centroid = member_centroid(graph, entity);
    if let Some(c) = graph.entity_mut(new_id) {
        c.centroid = child_centroid;
    }
    if let Some(p) = graph.entity_mut(entity) {
        if parent_centroid.is_some() {
            p.centroid = parent_centroid;
        }
        p.streaks.bimodal = 0;
    }
    info!(entity = %entity, child = %new_id, moved = moved.len(), "entity split");
    Some(TransitionRecord {
        entity,
        from: parent.stability_state,
        to: EntityFate::SplitInto(new_id),
        quality: parent.quality_score,
    })
}
