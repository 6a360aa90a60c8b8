//! The four per-tick phases, plus the invariant guard they share.
//!
//! Every phase works on a [`WorkingGraph`](crate::working::WorkingGraph)
//! synchronously. Only the engine touches the store.

pub mod stimulus;
pub mod valence;
pub mod redistribution;
pub mod workspace;
pub mod learning;

use std::fmt;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::InvariantMode;
use crate::model::{EntityId, NodeId};
use crate::working::WorkingGraph;
use crate::{Error, Result};

/// Pipeline position within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Injection,
    Redistribution,
    Selection,
    Learning,
    Lifecycle,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Injection,
        Phase::Redistribution,
        Phase::Selection,
        Phase::Learning,
        Phase::Lifecycle,
    ];

    /// The phase that runs after this one, `None` after lifecycle.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Injection => Some(Phase::Redistribution),
            Phase::Redistribution => Some(Phase::Selection),
            Phase::Selection => Some(Phase::Learning),
            Phase::Learning => Some(Phase::Lifecycle),
            Phase::Lifecycle => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Injection => "injection",
            Phase::Redistribution => "redistribution",
            Phase::Selection => "selection",
            Phase::Learning => "learning",
            Phase::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Threshold flips
// ============================================================================

/// Node or entity whose active state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum FlipSubject {
    Node(NodeId),
    Entity(EntityId),
}

impl fmt::Display for FlipSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipSubject::Node(id) => write!(f, "{id}"),
            FlipSubject::Entity(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flip {
    pub subject: FlipSubject,
    pub now_active: bool,
}

/// Active flags captured at the start of a phase.
#[derive(Debug, Clone, Default)]
pub struct ActivitySnapshot {
    nodes: HashMap<NodeId, bool>,
    entities: Vec<(EntityId, bool)>,
}

impl ActivitySnapshot {
    pub fn capture(graph: &WorkingGraph) -> Self {
        Self {
            nodes: graph.nodes().map(|n| (n.id, n.is_active())).collect(),
            entities: graph.entities().map(|e| (e.id, e.is_active())).collect(),
        }
    }

    pub fn was_active(&self, node: NodeId) -> bool {
        self.nodes.get(&node).copied().unwrap_or(false)
    }

    /// Everything whose active state differs from the capture, nodes first,
    /// each group in id order. Entities created or removed since are ignored.
    pub fn flips(&self, graph: &WorkingGraph) -> Vec<Flip> {
        let mut out: Vec<Flip> = graph
            .nodes()
            .filter(|n| self.was_active(n.id) != n.is_active())
            .map(|n| Flip { subject: FlipSubject::Node(n.id), now_active: n.is_active() })
            .collect();
        for (id, was) in &self.entities {
            if let Some(e) = graph.entity(*id) {
                if e.is_active() != *was {
                    out.push(Flip { subject: FlipSubject::Entity(*id), now_active: e.is_active() });
                }
            }
        }
        out
    }
}

// ============================================================================
// Invariant guard
// ============================================================================

/// Rounding noise below this magnitude is zeroed without a report.
pub const NEGATIVE_EPSILON: f64 = 1e-9;

/// Range checks for formula outputs.
///
/// In strict mode an out-of-range value is an [`Error::InvariantViolation`];
/// in clamp mode it is repaired, counted and logged.
#[derive(Debug, Clone, Copy)]
pub struct InvariantGuard {
    mode: InvariantMode,
    repaired: usize,
}

impl InvariantGuard {
    pub fn new(mode: InvariantMode) -> Self {
        Self { mode, repaired: 0 }
    }

    /// Values repaired so far (clamp mode only).
    pub fn repaired(&self) -> usize {
        self.repaired
    }

    /// Check an energy value: finite and non-negative.
    pub fn energy(&mut self, what: impl fmt::Display, value: f64) -> Result<f64> {
        if value.is_finite() && value >= 0.0 {
            return Ok(value);
        }
        if value.is_finite() && value > -NEGATIVE_EPSILON {
            return Ok(0.0);
        }
        self.violation(what, value, 0.0, f64::INFINITY, 0.0)
    }

    /// Check a value against the closed range `[lo, hi]`.
    pub fn range(&mut self, what: impl fmt::Display, value: f64, lo: f64, hi: f64) -> Result<f64> {
        if value.is_finite() && value >= lo && value <= hi {
            return Ok(value);
        }
        if value.is_finite() && value > lo - NEGATIVE_EPSILON && value < hi + NEGATIVE_EPSILON {
            return Ok(value.clamp(lo, hi));
        }
        let fallback = if value.is_nan() { lo } else { value.clamp(lo, hi) };
        self.violation(what, value, lo, hi, fallback)
    }

    pub fn unit(&mut self, what: impl fmt::Display, value: f64) -> Result<f64> {
        self.range(what, value, 0.0, 1.0)
    }

    fn violation(&mut self, what: impl fmt::Display, value: f64, lo: f64, hi: f64, repaired: f64) -> Result<f64> {
        match self.mode {
            InvariantMode::Strict => Err(Error::InvariantViolation(format!(
                "{what} = {value} outside [{lo}, {hi}]"
            ))),
            InvariantMode::Clamp => {
                self.repaired += 1;
                warn!(%what, value, repaired, "clamped out-of-range value");
                Ok(repaired)
            }
        }
    }
}
