//! Phase 1: stimulus injection.
//!
//! A request names a target and a budget. The budget is resolved into
//! per-node allocations that sum to it exactly, then added to node energy.
//!
//! | Target | Split |
//! |--------|-------|
//! | node | whole budget to the node |
//! | link | source gets `p_source` from the direction prior, target the rest |
//! | entity | members by normalised membership weight |
//! | similar | top-k nodes and link topics by cosine, proportional to similarity |
//!
//! An unresolvable target is a miss: logged, reported to the caller, and
//! otherwise ignored. Link traces are never touched here.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StimulusConfig;
use crate::model::*;
use crate::working::WorkingGraph;
use crate::Result;
use super::InvariantGuard;

/// What a stimulus is aimed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRef {
    Node(NodeId),
    Link(LinkId),
    Entity(EntityId),
    /// Resolve by embedding similarity.
    Similar(Embedding),
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetRef::Node(id) => write!(f, "{id}"),
            TargetRef::Link(id) => write!(f, "{id}"),
            TargetRef::Entity(id) => write!(f, "{id}"),
            TargetRef::Similar(e) => write!(f, "similar(dim={})", e.len()),
        }
    }
}

/// One external injection request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusRequest {
    pub target: TargetRef,
    pub magnitude: f64,
    /// Tried by similarity when `target` does not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

impl StimulusRequest {
    pub fn new(target: TargetRef, magnitude: f64) -> Self {
        Self { target, magnitude, embedding: None }
    }

    pub fn node(id: NodeId, magnitude: f64) -> Self {
        Self::new(TargetRef::Node(id), magnitude)
    }

    pub fn link(id: LinkId, magnitude: f64) -> Self {
        Self::new(TargetRef::Link(id), magnitude)
    }

    pub fn entity(id: EntityId, magnitude: f64) -> Self {
        Self::new(TargetRef::Entity(id), magnitude)
    }

    pub fn similar(embedding: impl Into<Embedding>, magnitude: f64) -> Self {
        Self::new(TargetRef::Similar(embedding.into()), magnitude)
    }

    /// Fall back to a similarity match if the named target is missing.
    pub fn with_fallback_embedding(mut self, embedding: impl Into<Embedding>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }
}

/// Per-request result returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InjectionOutcome {
    /// The budget was split across these nodes, in node id order.
    Injected { allocations: Vec<(NodeId, f64)> },
    Miss { reason: String },
}

impl InjectionOutcome {
    pub fn is_miss(&self) -> bool {
        matches!(self, InjectionOutcome::Miss { .. })
    }

    /// Energy actually added.
    pub fn injected(&self) -> f64 {
        match self {
            InjectionOutcome::Injected { allocations } => allocations.iter().map(|(_, e)| e).sum(),
            InjectionOutcome::Miss { .. } => 0.0,
        }
    }

    fn miss(reason: impl Into<String>) -> Self {
        InjectionOutcome::Miss { reason: reason.into() }
    }
}

// ============================================================================
// Resolution
// ============================================================================

fn split_link(link: &Link, budget: f64, prior: f64, out: &mut Vec<(NodeId, f64)>) {
    let to_source = budget * link.direction_prior(prior);
    out.push((link.source, to_source));
    out.push((link.target, budget - to_source));
}

fn resolve_similar(graph: &WorkingGraph, query: &[f32], budget: f64, cfg: &StimulusConfig) -> Vec<(NodeId, f64)> {
    enum Hit<'a> {
        Node(NodeId),
        Link(&'a Link),
    }
    let mut hits: Vec<(f64, u8, u64, Hit<'_>)> = Vec::new();
    for n in graph.nodes() {
        if let Some(sim) = n.embedding.as_deref().and_then(|e| cosine(query, e)) {
            hits.push((sim, 0, n.id.0, Hit::Node(n.id)));
        }
    }
    for l in graph.links() {
        if let Some(sim) = l.trace.topic_centroid.as_deref().and_then(|c| cosine(query, c)) {
            hits.push((sim, 1, l.id.0, Hit::Link(l)));
        }
    }
    hits.retain(|(sim, ..)| *sim > 0.0 && *sim >= cfg.min_similarity);
    hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    hits.truncate(cfg.similarity_top_k);

    let total: f64 = hits.iter().map(|(sim, ..)| sim).sum();
    let mut out = Vec::new();
    for (sim, _, _, hit) in hits {
        let share = budget * sim / total;
        match hit {
            Hit::Node(id) => out.push((id, share)),
            Hit::Link(l) => split_link(l, share, cfg.direction_prior, &mut out),
        }
    }
    out
}

/// Resolve a request into raw allocations, or the reason it missed.
fn resolve(graph: &WorkingGraph, req: &StimulusRequest, cfg: &StimulusConfig) -> std::result::Result<Vec<(NodeId, f64)>, String> {
    let budget = req.magnitude;
    let mut out = Vec::new();
    match &req.target {
        TargetRef::Node(id) => {
            if graph.node(*id).is_some() {
                out.push((*id, budget));
            }
        }
        TargetRef::Link(id) => {
            if let Some(l) = graph.link(*id) {
                split_link(l, budget, cfg.direction_prior, &mut out);
            }
        }
        TargetRef::Entity(id) => {
            for (n, w) in graph.memberships().normalized_members(*id) {
                out.push((n, budget * w));
            }
        }
        TargetRef::Similar(query) => out = resolve_similar(graph, query, budget, cfg),
    }
    if out.is_empty() {
        if let Some(query) = &req.embedding {
            out = resolve_similar(graph, query, budget, cfg);
        }
    }
    if out.is_empty() {
        return Err(format!("no match for {}", req.target));
    }

    // One entry per node; a link whose endpoints coincide merges here.
    out.sort_by_key(|(n, _)| *n);
    out.dedup_by(|next, kept| {
        if next.0 == kept.0 {
            kept.1 += next.1;
            true
        } else {
            false
        }
    });
    Ok(out)
}

// ============================================================================
// Injection
// ============================================================================

/// Resolve and apply one request.
pub fn inject(
    graph: &mut WorkingGraph,
    req: &StimulusRequest,
    cfg: &StimulusConfig,
    guard: &mut InvariantGuard,
) -> Result<InjectionOutcome> {
    if !(req.magnitude.is_finite() && req.magnitude >= 0.0) {
        warn!(stimulus = %req.target, magnitude = req.magnitude, "stimulus rejected: invalid magnitude");
        return Ok(InjectionOutcome::miss(format!("invalid magnitude {}", req.magnitude)));
    }
    let allocations = match resolve(graph, req, cfg) {
        Ok(a) => a,
        Err(reason) => {
            warn!(stimulus = %req.target, magnitude = req.magnitude, %reason, "stimulus miss");
            return Ok(InjectionOutcome::miss(reason));
        }
    };
    for (id, amount) in &allocations {
        if let Some(n) = graph.node_mut(*id) {
            n.energy = guard.energy(format_args!("{id}.energy"), n.energy + amount)?;
        }
    }
    debug!(stimulus = %req.target, magnitude = req.magnitude, nodes = allocations.len(), "stimulus injected");
    Ok(InjectionOutcome::Injected { allocations })
}

/// Apply a batch of requests in order.
pub fn inject_all(
    graph: &mut WorkingGraph,
    requests: &[StimulusRequest],
    cfg: &StimulusConfig,
    guard: &mut InvariantGuard,
) -> Result<Vec<InjectionOutcome>> {
    requests.iter().map(|r| inject(graph, r, cfg, guard)).collect()
}
