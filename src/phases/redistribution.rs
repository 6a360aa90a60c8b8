//! Phase 2: redistribution.
//!
//! ## Steps
//!
//! 1. **Stage** node strides against the pre-phase state. Every active
//!    source splits `surplus · stride_rate · scale` across its eligible
//!    links in proportion to `w_eff · g_dom`.
//! 2. **Barrier**: apply all staged strides at once. Each stride removes
//!    `ΔE` from its source and delivers `ΔE · (1 - stride_loss)`.
//! 3. **Boundary strides** between active entities, sequentially in
//!    entity id order on current state, using the remaining
//!    `1 - within_entity_share` of each entity's budget.
//! 4. **Decay**: remove `node_decay · E` from every node.
//! 5. **Flips and traces**: detect threshold flips, split precedence
//!    among contributing links, then run the per-link trace cascade.
//!
//! ## Trace cascade (per participating link, in this order)
//!
//! | # | Field | Sample |
//! |---|-------|--------|
//! | 1 | `ema_active` | `|ΔE|` strictly above the cohort median |
//! | 2 | `ema_flow_mag` | `|ΔE|` |
//! | 3 | `precedence_*` | `π = ΔE / Σ` over contributions to a flip |
//! | 4 | `ema_hunger_gates` | stride gate vector |
//! | 5 | `affect_tone_ema` | source affect vs link affect |
//! | 6 | `topic_centroid` | midpoint of endpoint embeddings |
//! | 7 | `last_payload_ts`, `observed_payloads_count` | tick time, +1 |
//!
//! Links whose source is inactive take no stride and get no trace update.

use std::collections::BTreeMap;
use std::fmt;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::{CohortScope, EngineConfig};
use crate::entity::refresh_aggregates;
use crate::model::*;
use crate::model::vector::{ema_embedding, midpoint};
use crate::working::WorkingGraph;
use crate::Result;
use super::valence::{boundary_scores, gates};
use super::{ActivitySnapshot, Flip, FlipSubject, InvariantGuard};

/// Contributors to one flip: link and its precedence share.
pub type Contributors = SmallVec<[(LinkId, f64); 4]>;

/// One energy transfer along one link.
#[derive(Debug, Clone, PartialEq)]
pub struct Stride {
    pub link: LinkId,
    pub dir: StrideDirection,
    pub from: NodeId,
    pub to: NodeId,
    /// Source energy when the stride was staged.
    pub source_energy: f64,
    /// Energy removed from the source.
    pub delta: f64,
    /// Energy added to the target.
    pub delivered: f64,
    pub gates: GateVector,
}

/// One entity-to-entity transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryStride {
    pub boundary: (EntityId, EntityId),
    pub delta: f64,
    pub delivered: f64,
}

/// A flip together with the links credited for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlipRecord {
    pub flip: Flip,
    pub contributors: Contributors,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedistributionOutcome {
    pub strides: Vec<Stride>,
    pub boundary_strides: Vec<BoundaryStride>,
    pub flips: Vec<FlipRecord>,
    /// Links that carried a payload this tick, in id order.
    pub touched_links: Vec<LinkId>,
    /// Σ ΔE over node and boundary strides.
    pub energy_moved: f64,
    /// Σ delivered over node and boundary strides.
    pub energy_delivered: f64,
    pub stride_loss: f64,
    pub decay_loss: f64,
}

// ============================================================================
// Rank-based active flag
// ============================================================================

/// Median of `values` padded with zeros up to `cohort_size` entries.
pub fn cohort_median(values: &[f64], cohort_size: usize) -> f64 {
    let mut all = values.to_vec();
    all.resize(cohort_size.max(values.len()), 0.0);
    if all.is_empty() {
        return 0.0;
    }
    all.sort_by(f64::total_cmp);
    let mid = all.len() / 2;
    if all.len() % 2 == 1 {
        all[mid]
    } else {
        (all[mid - 1] + all[mid]) / 2.0
    }
}

/// Allowed distance of a gate vector's sum from one.
pub const GATE_SUM_TOLERANCE: f64 = 1e-6;

/// Reject a gate vector with a component outside [0, 1] or a sum off one.
/// In clamp mode the repaired vector is renormalised.
pub fn check_gates(guard: &mut InvariantGuard, what: impl fmt::Display, g: GateVector) -> Result<GateVector> {
    if g.is_normalized(GATE_SUM_TOLERANCE) {
        return Ok(g);
    }
    for c in g.0 {
        guard.unit(format_args!("{what}.gate"), c)?;
    }
    guard.range(
        format_args!("{what}.gate_sum"),
        g.sum(),
        1.0 - GATE_SUM_TOLERANCE,
        1.0 + GATE_SUM_TOLERANCE,
    )?;
    Ok(GateVector::from_scores(g.0, &[1.0; HUNGER_COUNT]))
}

/// Whether `value` ranks strictly above the median of a cohort of
/// `cohort_size` links, of which `values` are the non-idle ones.
pub fn rank_active(value: f64, values: &[f64], cohort_size: usize) -> bool {
    value > cohort_median(values, cohort_size)
}

// ============================================================================
// Phase entry point
// ============================================================================

/// Run one redistribution phase. Entity aggregates must be current on entry
/// and are current on exit.
pub fn redistribute(graph: &mut WorkingGraph, cfg: &EngineConfig, guard: &mut InvariantGuard) -> Result<RedistributionOutcome> {
    let before = ActivitySnapshot::capture(graph);
    let mut out = RedistributionOutcome::default();

    out.strides = stage_strides(graph, cfg, guard)?;
    for s in &out.strides {
        if let Some(n) = graph.node_mut(s.from) {
            n.energy = guard.energy(format_args!("{}.energy", s.from), n.energy - s.delta)?;
        }
        if let Some(n) = graph.node_mut(s.to) {
            n.energy = guard.energy(format_args!("{}.energy", s.to), n.energy + s.delivered)?;
        }
        out.energy_moved += s.delta;
        out.energy_delivered += s.delivered;
        out.stride_loss += s.delta - s.delivered;
    }
    refresh_aggregates(graph, cfg.lifecycle.quality_discount);

    if graph.has_entities() && cfg.diffusion.within_entity_share < 1.0 {
        boundary_strides(graph, cfg, guard, &mut out)?;
    }

    if cfg.diffusion.node_decay > 0.0 {
        let ids = graph.node_ids().to_vec();
        for id in ids {
            if let Some(n) = graph.node_mut(id) {
                let lost = n.energy * cfg.diffusion.node_decay;
                n.energy = guard.energy(format_args!("{id}.energy"), n.energy - lost)?;
                out.decay_loss += lost;
            }
        }
        refresh_aggregates(graph, cfg.lifecycle.quality_discount);
    }

    let precedence = attribute_flips(graph, &before, &mut out);
    update_traces(graph, cfg, guard, &mut out, &precedence)?;

    debug!(
        strides = out.strides.len(),
        boundary_strides = out.boundary_strides.len(),
        moved = out.energy_moved,
        flips = out.flips.len(),
        "redistribution finished"
    );
    Ok(out)
}

// ============================================================================
// Node strides
// ============================================================================

fn stage_strides(graph: &WorkingGraph, cfg: &EngineConfig, guard: &mut InvariantGuard) -> Result<Vec<Stride>> {
    let d = &cfg.diffusion;
    let scale = if graph.has_entities() { d.within_entity_share } else { 1.0 };
    let mut staged = Vec::new();

    for &id in graph.node_ids() {
        let Some(src) = graph.node(id) else { continue };
        if !src.is_active() || src.surplus() <= 0.0 {
            continue;
        }
        let budget = src.surplus() * d.stride_rate * scale;
        if budget <= 0.0 {
            continue;
        }

        // (link, direction, gates, weight factor)
        let mut candidates: Vec<(LinkId, StrideDirection, GateVector, f64)> = Vec::new();
        let directions = [(StrideDirection::Forward, graph.out_links(id), 1.0), (StrideDirection::Backward, graph.in_links(id), d.reverse_stride_factor)];
        for (dir, links, factor) in directions {
            if factor <= 0.0 {
                continue;
            }
            for &lid in links {
                let Some(link) = graph.link(lid) else { continue };
                if link.source == link.target {
                    continue;
                }
                let g = check_gates(guard, lid, gates(graph, link, dir, &d.hunger_weights))?;
                let w = link.effective_weight() * g.dominant().1 * factor;
                if w > 0.0 && w.is_finite() {
                    candidates.push((lid, dir, g, w));
                }
            }
        }
        let total: f64 = candidates.iter().map(|c| c.3).sum();
        if total <= 0.0 {
            continue;
        }

        for (lid, dir, g, w) in candidates {
            let Some(link) = graph.link(lid) else { continue };
            let delta = budget * w / total;
            let delta = guard.range(format_args!("{lid}.stride"), delta, 0.0, src.energy)?;
            let stride = Stride {
                link: lid,
                dir,
                from: id,
                to: link.to_node(dir),
                source_energy: src.energy,
                delta,
                delivered: delta * (1.0 - d.stride_loss),
                gates: g,
            };
            trace!(link = %lid, from = %stride.from, to = %stride.to, delta, "stride staged");
            staged.push(stride);
        }
    }
    Ok(staged)
}

// ============================================================================
// Boundary strides
// ============================================================================

fn boundary_strides(
    graph: &mut WorkingGraph,
    cfg: &EngineConfig,
    guard: &mut InvariantGuard,
    out: &mut RedistributionOutcome,
) -> Result<()> {
    let d = &cfg.diffusion;
    let tick_time = graph.tick_time();

    for source in graph.entity_ids() {
        let Some(entity) = graph.entity(source) else { continue };
        if !entity.is_active() {
            continue;
        }
        let budget = entity.surplus() * d.stride_rate * (1.0 - d.within_entity_share);
        if budget <= 0.0 {
            continue;
        }

        let mut routes: Vec<((EntityId, EntityId), f64)> = Vec::new();
        for key in graph.outgoing_boundaries(source) {
            let Some(b) = graph.boundary(key) else { continue };
            if graph.memberships().member_count(b.target) == 0 {
                continue;
            }
            let g = GateVector::from_scores(boundary_scores(graph, b), &d.hunger_weights);
            let w = b.ease() * g.dominant().1;
            if w > 0.0 && w.is_finite() {
                routes.push((key, w));
            }
        }
        let total: f64 = routes.iter().map(|r| r.1).sum();
        if total <= 0.0 {
            continue;
        }

        // Draw from members in proportion to their surplus contribution.
        let draws: Vec<(NodeId, f64)> = graph
            .memberships()
            .normalized_members(source)
            .into_iter()
            .filter_map(|(n, w)| graph.node(n).map(|node| (n, w * node.surplus())))
            .filter(|(_, c)| *c > 0.0)
            .collect();
        let draw_total: f64 = draws.iter().map(|d| d.1).sum();
        if draw_total <= 0.0 {
            continue;
        }

        for (key, w) in routes {
            let delta = budget * w / total;
            let delivered = delta * (1.0 - d.stride_loss);
            for (n, c) in &draws {
                if let Some(node) = graph.node_mut(*n) {
                    node.energy = guard.energy(format_args!("{n}.energy"), node.energy - delta * c / draw_total)?;
                }
            }
            for (n, m) in graph.memberships().normalized_members(key.1) {
                if let Some(node) = graph.node_mut(n) {
                    node.energy = guard.energy(format_args!("{n}.energy"), node.energy + delivered * m)?;
                }
            }
            if let Some(b) = graph.boundary_mut(key) {
                b.ema_flow_mag = ema(b.ema_flow_mag, delta, cfg.ema_alpha);
                b.boundary_stride_count += 1;
                b.last_payload_ts = Some(tick_time);
            }
            trace!(source = %key.0, target = %key.1, delta, "boundary stride");
            out.boundary_strides.push(BoundaryStride { boundary: key, delta, delivered });
            out.energy_moved += delta;
            out.energy_delivered += delivered;
            out.stride_loss += delta - delivered;
        }
        refresh_aggregates(graph, cfg.lifecycle.quality_discount);
    }
    Ok(())
}

// ============================================================================
// Flips and precedence
// ============================================================================

/// Record every flip and return the precedence share per (link, direction).
fn attribute_flips(
    graph: &WorkingGraph,
    before: &ActivitySnapshot,
    out: &mut RedistributionOutcome,
) -> BTreeMap<(LinkId, bool), f64> {
    let mut shares = BTreeMap::new();
    for flip in before.flips(graph) {
        let mut contributors = Contributors::new();
        if let (FlipSubject::Node(node), true) = (flip.subject, flip.now_active) {
            let incoming: Vec<&Stride> = out.strides.iter().filter(|s| s.to == node && s.delivered > 0.0).collect();
            let total: f64 = incoming.iter().map(|s| s.delivered).sum();
            if total > 0.0 {
                for s in incoming {
                    let pi = s.delivered / total;
                    *shares.entry((s.link, s.dir == StrideDirection::Forward)).or_insert(0.0) += pi;
                    contributors.push((s.link, pi));
                }
            }
        }
        out.flips.push(FlipRecord { flip, contributors });
    }
    shares
}

// ============================================================================
// Trace cascade
// ============================================================================

fn update_traces(
    graph: &mut WorkingGraph,
    cfg: &EngineConfig,
    guard: &mut InvariantGuard,
    out: &mut RedistributionOutcome,
    precedence: &BTreeMap<(LinkId, bool), f64>,
) -> Result<()> {
    let alpha = cfg.ema_alpha;
    let tick_time = graph.tick_time();

    // Per link: total |ΔE|, delta-weighted gates, stride with the largest ΔE.
    let mut per_link: BTreeMap<LinkId, (f64, [f64; HUNGER_COUNT], usize)> = BTreeMap::new();
    for (i, s) in out.strides.iter().enumerate() {
        let entry = per_link.entry(s.link).or_insert((0.0, [0.0; HUNGER_COUNT], i));
        entry.0 += s.delta.abs();
        for (acc, g) in entry.1.iter_mut().zip(s.gates.0) {
            *acc += g * s.delta.abs();
        }
        if s.delta > out.strides[entry.2].delta {
            entry.2 = i;
        }
    }
    let magnitudes: Vec<f64> = per_link.values().map(|v| v.0).collect();
    let cohort_size = match cfg.diffusion.active_cohort {
        CohortScope::Touched => magnitudes.len(),
        CohortScope::AllLinks => graph.link_count(),
    };
    let median = cohort_median(&magnitudes, cohort_size);

    for (lid, (mag, gate_acc, main)) in per_link {
        let stride = &out.strides[main];
        let (from, to) = (stride.from, stride.to);
        let source_affect = graph.node(from).and_then(|n| n.affect);
        let topic = match (graph.node(from), graph.node(to)) {
            (Some(a), Some(b)) => match (a.embedding.as_deref(), b.embedding.as_deref()) {
                (Some(x), Some(y)) => midpoint(x, y),
                _ => None,
            },
            _ => None,
        };
        let sample_gates = if mag > 0.0 {
            GateVector(gate_acc.map(|g| g / mag))
        } else {
            stride.gates
        };

        let Some(link) = graph.link_mut(lid) else { continue };
        let t = &mut link.trace;

        // 1. rank-based active flag
        let active = if mag > median { 1.0 } else { 0.0 };
        t.ema_active = guard.unit(format_args!("{lid}.ema_active"), ema(t.ema_active, active, alpha))?;
        // 2. flow magnitude
        t.ema_flow_mag = guard.energy(format_args!("{lid}.ema_flow_mag"), ema(t.ema_flow_mag, mag, alpha))?;
        // 3. precedence
        if let Some(pi) = precedence.get(&(lid, true)) {
            t.precedence_forward += pi;
        }
        if let Some(pi) = precedence.get(&(lid, false)) {
            t.precedence_backward += pi;
        }
        // 4. hunger gates
        t.ema_hunger_gates.fold(&sample_gates, alpha);
        for h in Hunger::ALL {
            t.ema_hunger_gates.0[h.index()] =
                guard.unit(format_args!("{lid}.ema_hunger_gates[{h}]"), t.ema_hunger_gates[h])?;
        }
        // 5. affect tone
        if let Some(tone) = source_affect.zip(link.affect).and_then(|(s, l)| s.tone(&l)) {
            let t = &mut link.trace;
            t.affect_tone_ema = guard.range(format_args!("{lid}.affect_tone_ema"), ema(t.affect_tone_ema, tone, alpha), -1.0, 1.0)?;
        }
        let t = &mut link.trace;
        // 6. topic centroid
        if let Some(sample) = topic {
            t.topic_centroid = Some(ema_embedding(t.topic_centroid.as_deref(), &sample, alpha));
        }
        // 7. payload bookkeeping
        t.last_payload_ts = Some(tick_time);
        t.observed_payloads_count += 1;

        out.touched_links.push(lid);
    }
    Ok(())
}
