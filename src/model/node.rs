//! Node: the unit that carries energy.

use serde::{Deserialize, Serialize};
use super::{Affect, Embedding};

/// Opaque node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Visibility / ownership tag. One graph instance runs over one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self("personal".into())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node in the activation graph.
///
/// `energy` is never negative and `threshold` is strictly positive.
/// A node is active iff `energy >= threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub energy: f64,
    pub threshold: f64,
    /// Bumped once per committed tick in which the node changed.
    pub version: u64,
    pub log_weight: f64,
    pub ema_trace_seats: f64,
    pub ema_wm_presence: f64,
    pub ema_formation_quality: f64,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affect: Option<Affect>,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            energy: 0.0,
            threshold: 1.0,
            version: 0,
            log_weight: 0.0,
            ema_trace_seats: 0.0,
            ema_wm_presence: 0.0,
            ema_formation_quality: 0.0,
            scope: Scope::default(),
            embedding: None,
            affect: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Scope::new(scope);
        self
    }

    pub fn with_embedding(mut self, embedding: impl Into<Embedding>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }

    pub fn with_affect(mut self, affect: Affect) -> Self {
        self.affect = Some(affect);
        self
    }

    /// Closed interval: `E == θ` counts as active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.energy >= self.threshold
    }

    /// `max(0, E - θ)`.
    #[inline]
    pub fn surplus(&self) -> f64 {
        (self.energy - self.threshold).max(0.0)
    }

    /// `max(0, θ - E)`.
    #[inline]
    pub fn gap(&self) -> f64 {
        (self.threshold - self.energy).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_closed_interval() {
        let n = Node::new(NodeId(1), "a").with_threshold(5.0).with_energy(5.0);
        assert!(n.is_active());
        assert_eq!(n.surplus(), 0.0);
        let n = n.with_energy(4.999);
        assert!(!n.is_active());
        assert!((n.gap() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_node_serde_omits_missing_vectors() {
        let n = Node::new(NodeId(7), "x");
        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("embedding").is_none());
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, n);
    }
}
