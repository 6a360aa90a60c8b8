//! Explicit edge records between nodes and entities.
//!
//! | Record | Edge | Key |
//! |--------|------|-----|
//! | [`Membership`] | `BELONGS_TO` node → entity | `(node, entity)` |
//! | [`Boundary`] | `RELATES_TO` entity → entity | `(source, target)` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::{EntityId, NodeId};

/// Weighted `BELONGS_TO` edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub node: NodeId,
    pub entity: EntityId,
    pub weight: f64,
}

impl Membership {
    pub fn new(node: NodeId, entity: EntityId, weight: f64) -> Self {
        Self { node, entity, weight }
    }

    pub fn key(&self) -> (NodeId, EntityId) {
        (self.node, self.entity)
    }
}

/// Directed `RELATES_TO` boundary between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub source: EntityId,
    pub target: EntityId,
    /// Learned ease of crossing; plays the role of link weight at entity scale.
    pub ease_log_weight: f64,
    pub ema_flow_mag: f64,
    pub boundary_stride_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payload_ts: Option<DateTime<Utc>>,
}

impl Boundary {
    pub fn new(source: EntityId, target: EntityId) -> Self {
        Self {
            source,
            target,
            ease_log_weight: 0.0,
            ema_flow_mag: 0.0,
            boundary_stride_count: 0,
            last_payload_ts: None,
        }
    }

    pub fn key(&self) -> (EntityId, EntityId) {
        (self.source, self.target)
    }

    pub fn ease(&self) -> f64 {
        self.ease_log_weight.exp()
    }
}
