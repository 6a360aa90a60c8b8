//! Entities: weighted aggregates over member nodes.

use serde::{Deserialize, Serialize};
use super::{Embedding, Scope};

/// Opaque entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Functional role vs. semantic topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Functional,
    Semantic,
}

/// Lifecycle stage. Merge, split and dissolve are transitions, not stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityState {
    Candidate,
    Provisional,
    Mature,
}

impl std::fmt::Display for StabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StabilityState::Candidate => f.write_str("candidate"),
            StabilityState::Provisional => f.write_str("provisional"),
            StabilityState::Mature => f.write_str("mature"),
        }
    }
}

/// Coarse activation label derived from `energy_runtime / threshold_runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationLevel {
    #[default]
    Absent,
    Weak,
    Moderate,
    Strong,
    Dominant,
}

impl ActivationLevel {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio > 3.0 {
            ActivationLevel::Dominant
        } else if ratio > 2.0 {
            ActivationLevel::Strong
        } else if ratio > 1.0 {
            ActivationLevel::Moderate
        } else if ratio > 0.5 {
            ActivationLevel::Weak
        } else {
            ActivationLevel::Absent
        }
    }
}

/// How an entity came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    RoleSeed,
    SemanticClustering,
    CoActivation,
    TraceFormation,
    Split,
}

/// A named aggregate over member nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Embedding>,

    // Runtime aggregates, recomputed from members every phase.
    pub energy_runtime: f64,
    pub threshold_runtime: f64,
    pub activation_level_runtime: ActivationLevel,

    // Structure.
    pub coherence_ema: f64,
    pub member_count: usize,

    // Learning state, mirrors the node traces.
    pub log_weight: f64,
    pub ema_active: f64,
    pub ema_wm_presence: f64,
    pub ema_trace_seats: f64,
    pub ema_formation_quality: f64,

    // Lifecycle.
    pub stability_state: StabilityState,
    pub quality_score: f64,
    pub frames_since_creation: u64,
    #[serde(default)]
    pub streaks: LifecycleStreaks,

    // Provenance.
    pub created_from: EntityOrigin,
    pub created_by: String,
    pub version: u64,
}

/// Consecutive-tick counters backing the sustained-window rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LifecycleStreaks {
    pub above_median: u64,
    pub above_p75: u64,
    pub below_low_water: u64,
    pub bimodal: u64,
}

impl Entity {
    pub fn new(id: EntityId, name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            scope: Scope::default(),
            centroid: None,
            energy_runtime: 0.0,
            threshold_runtime: 0.0,
            activation_level_runtime: ActivationLevel::Absent,
            coherence_ema: 0.0,
            member_count: 0,
            log_weight: 0.0,
            ema_active: 0.0,
            ema_wm_presence: 0.0,
            ema_trace_seats: 0.0,
            ema_formation_quality: 0.0,
            stability_state: StabilityState::Candidate,
            quality_score: 0.0,
            frames_since_creation: 0,
            streaks: LifecycleStreaks::default(),
            created_from: EntityOrigin::RoleSeed,
            created_by: "ingestion".into(),
            version: 0,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Scope::new(scope);
        self
    }

    pub fn with_centroid(mut self, centroid: impl Into<Embedding>) -> Self {
        self.centroid = Some(centroid.into());
        self
    }

    pub fn with_origin(mut self, origin: EntityOrigin, by: impl Into<String>) -> Self {
        self.created_from = origin;
        self.created_by = by.into();
        self
    }

    /// Active iff it has members and runtime energy reaches the runtime threshold.
    pub fn is_active(&self) -> bool {
        self.member_count > 0
            && self.threshold_runtime > 0.0
            && self.energy_runtime >= self.threshold_runtime
    }

    pub fn surplus(&self) -> f64 {
        (self.energy_runtime - self.threshold_runtime).max(0.0)
    }
}
