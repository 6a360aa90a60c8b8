//! Directed links and their trace accumulators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::{Affect, Embedding, GateVector, NodeId};

/// Opaque link identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Which way energy moved along a link during a stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrideDirection {
    /// source → target
    Forward,
    /// target → source
    Backward,
}

/// Historical flow statistics for one link.
///
/// Written only by the redistribution phase. `ema_active` and every
/// component of `ema_hunger_gates` stay within [0, 1]; `affect_tone_ema`
/// stays within [-1, 1].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkTrace {
    pub ema_active: f64,
    pub ema_flow_mag: f64,
    pub precedence_forward: f64,
    pub precedence_backward: f64,
    pub ema_hunger_gates: GateVector,
    pub affect_tone_ema: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_centroid: Option<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payload_ts: Option<DateTime<Utc>>,
    pub observed_payloads_count: u64,
}

/// A directed, weighted link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: String,
    /// Static weight, set at ingestion.
    pub weight: f64,
    /// Learned weight, written only by the learning phase.
    pub log_weight: f64,
    /// Notional affect the link carries, compared against source affect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affect: Option<Affect>,
    #[serde(default)]
    pub trace: LinkTrace,
}

impl Link {
    pub fn new(id: LinkId, source: NodeId, target: NodeId, kind: impl Into<String>) -> Self {
        Self {
            id,
            source,
            target,
            kind: kind.into(),
            weight: 1.0,
            log_weight: 0.0,
            affect: None,
            trace: LinkTrace::default(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_affect(mut self, affect: Affect) -> Self {
        self.affect = Some(affect);
        self
    }

    /// Static weight scaled by the learned weight.
    #[inline]
    pub fn effective_weight(&self) -> f64 {
        self.weight.max(0.0) * self.log_weight.exp()
    }

    /// Node energy flows out of for the given direction.
    pub fn from_node(&self, dir: StrideDirection) -> NodeId {
        match dir {
            StrideDirection::Forward => self.source,
            StrideDirection::Backward => self.target,
        }
    }

    /// Node energy flows into for the given direction.
    pub fn to_node(&self, dir: StrideDirection) -> NodeId {
        match dir {
            StrideDirection::Forward => self.target,
            StrideDirection::Backward => self.source,
        }
    }

    /// Share of a link-matched stimulus that goes to the source endpoint.
    ///
    /// `(pf + prior) / (pf + pb + 2·prior)`; a link with no history splits evenly.
    pub fn direction_prior(&self, prior: f64) -> f64 {
        let pf = self.trace.precedence_forward.max(0.0);
        let pb = self.trace.precedence_backward.max(0.0);
        let denom = pf + pb + 2.0 * prior;
        if denom <= f64::EPSILON {
            return 0.5;
        }
        (pf + prior) / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_prior_even_without_history() {
        let l = Link::new(LinkId(1), NodeId(1), NodeId(2), "relates");
        assert!((l.direction_prior(1.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_direction_prior_follows_precedence() {
        let mut l = Link::new(LinkId(1), NodeId(1), NodeId(2), "relates");
        l.trace.precedence_forward = 3.0;
        l.trace.precedence_backward = 1.0;
        // (3 + 1) / (3 + 1 + 2)
        assert!((l.direction_prior(1.0) - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_endpoints_by_direction() {
        let l = Link::new(LinkId(1), NodeId(1), NodeId(2), "relates");
        assert_eq!(l.from_node(StrideDirection::Forward), NodeId(1));
        assert_eq!(l.to_node(StrideDirection::Backward), NodeId(1));
    }
}
