//! Engine configuration.
//!
//! Every tunable lives here. Loaded from TOML, missing sections and keys
//! fall back to defaults, and [`EngineConfig::validate`] rejects values the
//! formulas cannot handle.
//!
//! ```toml
//! ema_alpha = 0.1
//!
//! [diffusion]
//! stride_rate = 0.5
//! active_cohort = "all_links"
//!
//! [lifecycle]
//! priority = ["dissolve", "merge", "split", "promote"]
//! ```

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::model::HUNGER_COUNT;
use crate::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shared EMA smoothing constant (weight of the new sample).
    pub ema_alpha: f64,
    /// What happens when a formula produces an out-of-range value.
    pub invariant_mode: InvariantMode,
    pub stimulus: StimulusConfig,
    pub diffusion: DiffusionConfig,
    pub workspace: WorkspaceConfig,
    pub learning: LearningConfig,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
}

/// Strict aborts the tick with [`Error::InvariantViolation`]; clamp repairs
/// the value and logs a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantMode {
    Strict,
    Clamp,
}

impl Default for InvariantMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            InvariantMode::Strict
        } else {
            InvariantMode::Clamp
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Smoothing prior for splitting link-matched budgets between endpoints.
    pub direction_prior: f64,
    /// Maximum number of similarity matches per request.
    pub similarity_top_k: usize,
    /// Cosine floor for similarity matches.
    pub min_similarity: f64,
}

/// Which links form the cohort for the rank-based active flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortScope {
    /// Only links that carried a stride this tick.
    Touched,
    /// Every link in the instance; idle links count as zero flow.
    AllLinks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Fraction of an active source's surplus moved per tick.
    pub stride_rate: f64,
    /// Fraction of each stride removed instead of delivered.
    pub stride_loss: f64,
    /// Fraction of every node's energy removed at the end of redistribution.
    pub node_decay: f64,
    /// Share of the tick budget used by node-level strides when entities exist;
    /// the rest goes to entity boundary strides.
    pub within_entity_share: f64,
    /// Relative strength of target → source strides. Zero disables them.
    pub reverse_stride_factor: f64,
    pub active_cohort: CohortScope,
    /// Per-hunger weights applied before normalising gates.
    pub hunger_weights: [f64; HUNGER_COUNT],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub min_items: usize,
    pub max_items: usize,
    /// Highest-energy members listed under each selected entity.
    pub members_per_entity: usize,
    /// Highest-flow boundaries listed after the entities.
    pub boundary_links: usize,
    pub base_token_cost: f64,
    pub member_token_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Step size of the log-space update.
    pub rate: f64,
    /// Credit per unit of `ema_flow_mag` for links.
    pub link_credit_scale: f64,
    /// Credit per unit of `ema_flow_mag` for boundaries.
    pub boundary_credit_scale: f64,
}

/// Lifecycle transition kinds, used to order conflicting transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Dissolve,
    Merge,
    Split,
    Promote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Ticks above the cohort median before candidate → provisional.
    pub promote_window: u64,
    /// Ticks above the cohort 75th percentile before provisional → mature.
    pub mature_window: u64,
    /// Ticks below `low_water` before dissolving.
    pub dissolve_window: u64,
    /// Ticks of sustained bimodality before splitting.
    pub split_window: u64,
    /// Entities younger than this many ticks are never dissolved.
    pub min_dissolve_age: u64,
    /// Entities younger than this many ticks are never promoted to mature.
    pub min_mature_age: u64,
    pub low_water: f64,
    pub merge_centroid_similarity: f64,
    /// Shared members over the smaller membership.
    pub merge_overlap: f64,
    /// Bimodality coefficient above which member energies count as bimodal.
    pub split_bimodality: f64,
    pub split_min_members: usize,
    /// How much quality lowers an entity's runtime threshold.
    pub quality_discount: f64,
    /// First entry wins when several transitions apply to one entity.
    pub priority: Vec<TransitionKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// EMA weight of a freshly computed interval.
    pub interval_smoothing: f64,
    /// Ticks in the branching-ratio rolling mean.
    pub branching_window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            invariant_mode: InvariantMode::default(),
            stimulus: StimulusConfig::default(),
            diffusion: DiffusionConfig::default(),
            workspace: WorkspaceConfig::default(),
            learning: LearningConfig::default(),
            lifecycle: LifecycleConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self { direction_prior: 1.0, similarity_top_k: 3, min_similarity: 0.5 }
    }
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            stride_rate: 0.5,
            stride_loss: 0.0,
            node_decay: 0.0,
            within_entity_share: 0.8,
            reverse_stride_factor: 0.0,
            active_cohort: CohortScope::Touched,
            hunger_weights: [1.0; HUNGER_COUNT],
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            min_items: 5,
            max_items: 9,
            members_per_entity: 2,
            boundary_links: 2,
            base_token_cost: 50.0,
            member_token_cost: 10.0,
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self { rate: 0.1, link_credit_scale: 1.0, boundary_credit_scale: 1.0 }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            promote_window: 100,
            mature_window: 500,
            dissolve_window: 100,
            split_window: 25,
            min_dissolve_age: 1000,
            min_mature_age: 100,
            low_water: 0.2,
            merge_centroid_similarity: 0.9,
            merge_overlap: 0.5,
            split_bimodality: 0.75,
            split_min_members: 4,
            quality_discount: 0.2,
            priority: vec![
                TransitionKind::Dissolve,
                TransitionKind::Merge,
                TransitionKind::Split,
                TransitionKind::Promote,
            ],
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_interval_ms: 60_000,
            interval_smoothing: 0.3,
            branching_window: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff_ms: 25, max_backoff_ms: 1_000 }
    }
}

// ============================================================
// Loading and validation
// ============================================================

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields defaults; a malformed
    /// or invalid one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                tracing::info!(path = %path.display(), "loaded engine config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no engine config, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, v: f64) -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::ConfigError(format!("{name} must be in [0, 1], got {v}")))
            }
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(Error::ConfigError(format!("ema_alpha must be in (0, 1], got {}", self.ema_alpha)));
        }
        unit("diffusion.stride_rate", self.diffusion.stride_rate)?;
        unit("diffusion.stride_loss", self.diffusion.stride_loss)?;
        unit("diffusion.node_decay", self.diffusion.node_decay)?;
        unit("diffusion.within_entity_share", self.diffusion.within_entity_share)?;
        unit("diffusion.reverse_stride_factor", self.diffusion.reverse_stride_factor)?;
        unit("learning.rate", self.learning.rate)?;
        unit("lifecycle.low_water", self.lifecycle.low_water)?;
        unit("lifecycle.merge_overlap", self.lifecycle.merge_overlap)?;
        unit("lifecycle.quality_discount", self.lifecycle.quality_discount)?;
        unit("scheduler.interval_smoothing", self.scheduler.interval_smoothing)?;
        if self.diffusion.hunger_weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(Error::ConfigError("diffusion.hunger_weights must be non-negative".into()));
        }
        if !(self.stimulus.direction_prior > 0.0) {
            return Err(Error::ConfigError("stimulus.direction_prior must be positive".into()));
        }
        if self.workspace.min_items > self.workspace.max_items || self.workspace.max_items == 0 {
            return Err(Error::ConfigError(format!(
                "workspace bounds {}..={} are empty",
                self.workspace.min_items, self.workspace.max_items
            )));
        }
        if self.scheduler.min_interval_ms == 0 || self.scheduler.min_interval_ms > self.scheduler.max_interval_ms {
            return Err(Error::ConfigError(format!(
                "scheduler interval bounds {}..={} ms are invalid",
                self.scheduler.min_interval_ms, self.scheduler.max_interval_ms
            )));
        }
        if self.scheduler.branching_window == 0 {
            return Err(Error::ConfigError("scheduler.branching_window must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::ConfigError("retry.max_attempts must be at least 1".into()));
        }
        let p = &self.lifecycle.priority;
        for kind in [TransitionKind::Dissolve, TransitionKind::Merge, TransitionKind::Split, TransitionKind::Promote] {
            if p.iter().filter(|k| **k == kind).count() != 1 {
                return Err(Error::ConfigError(format!(
                    "lifecycle.priority must list {kind:?} exactly once"
                )));
            }
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl RetryConfig {
    /// Exponential backoff before attempt `attempt + 1` (attempt counts from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}
