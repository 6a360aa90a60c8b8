//! Adaptive tick pacing.
//!
//! The branching ratio σ of a tick is the energy its strides moved over the
//! energy that entered the frontier (this tick's injection plus what the
//! previous tick's strides delivered). Its rolling mean picks the interval:
//!
//! ```text
//! arousal  = clamp(σ / 1.5, 0.05, 1)
//! target   = max - (max - min) · arousal
//! interval = clamp(ema(interval, target, β) · multiplier, min, max)
//! ```
//!
//! | σ (smoothed) | Class |
//! |--------------|-------|
//! | < 0.5 | dying |
//! | < 0.8 | subcritical |
//! | < 1.2 | critical |
//! | otherwise | supercritical |

use std::collections::VecDeque;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::storage::GraphStore;
use crate::Result;
use super::{Engine, TickProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Dying,
    Subcritical,
    Critical,
    Supercritical,
}

impl Criticality {
    pub fn from_ratio(sigma: f64) -> Self {
        if sigma < 0.5 {
            Criticality::Dying
        } else if sigma < 0.8 {
            Criticality::Subcritical
        } else if sigma < 1.2 {
            Criticality::Critical
        } else {
            Criticality::Supercritical
        }
    }
}

/// Rolling branching-ratio measurement. Updated only for committed ticks.
#[derive(Debug, Clone)]
pub struct BranchingTracker {
    window: VecDeque<f64>,
    capacity: usize,
    last_delivered: f64,
}

impl BranchingTracker {
    pub fn new(capacity: usize) -> Self {
        Self { window: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1), last_delivered: 0.0 }
    }

    /// Raw σ for a tick that moved `moved` after `injected` entered.
    pub fn measure(&self, moved: f64, injected: f64) -> f64 {
        let entered = injected + self.last_delivered;
        if entered <= f64::EPSILON {
            0.0
        } else {
            moved / entered
        }
    }

    /// Fold a committed tick in; returns the new rolling mean.
    pub fn record(&mut self, raw: f64, delivered: f64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(raw);
        self.last_delivered = delivered;
        self.smoothed()
    }

    pub fn smoothed(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

pub fn arousal(sigma: f64) -> f64 {
    (sigma / 1.5).clamp(0.05, 1.0)
}

/// Turns smoothed σ into the next inter-tick interval.
#[derive(Debug, Clone)]
pub struct TickPacer {
    cfg: SchedulerConfig,
    smoothed_ms: Option<f64>,
}

impl TickPacer {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self { cfg, smoothed_ms: None }
    }

    pub fn next_interval(&mut self, sigma: f64, multiplier: f64, stimulus_pending: bool) -> Duration {
        let (min, max) = (self.cfg.min_interval_ms as f64, self.cfg.max_interval_ms as f64);
        let target = max - (max - min) * arousal(sigma);
        let smoothed = match self.smoothed_ms {
            Some(prev) => prev + self.cfg.interval_smoothing * (target - prev),
            None => target,
        };
        self.smoothed_ms = Some(smoothed);
        if stimulus_pending {
            return self.cfg.min_interval();
        }
        Duration::from_millis((smoothed * multiplier).clamp(min, max).round() as u64)
    }
}

// ============================================================================
// Tick loop
// ============================================================================

impl<S: GraphStore> Engine<S> {
    /// Drive ticks until stopped.
    ///
    /// Freezing suspends at the next phase boundary; resuming continues from
    /// there. A tick that exhausts its transient retries is logged and the
    /// loop carries on; any other error ends the loop.
    pub async fn run(&mut self) -> Result<()> {
        let control = self.control();
        let mut rx = control.subscribe();
        info!(instance = %self.id(), "tick loop started");
        loop {
            let state = control.state();
            if state.stopped {
                break;
            }
            if state.frozen {
                control.wait_until_runnable().await;
                continue;
            }

            let interval = match self.advance().await {
                Ok(TickProgress::Suspended { tick, next }) => {
                    debug!(instance = %self.id(), tick, %next, "tick suspended");
                    continue;
                }
                Ok(TickProgress::Completed(report)) => report.next_interval,
                Err(e) if e.is_transient() => {
                    error!(instance = %self.id(), error = %e, "tick failed, continuing");
                    let retry = &self.config().retry;
                    self.config().scheduler.min_interval().max(retry.backoff(retry.max_attempts))
                }
                Err(e) => {
                    error!(instance = %self.id(), error = %e, "tick loop aborted");
                    return Err(e);
                }
            };

            // Sleep, waking early for control changes and fresh stimulus.
            let mut deadline = tokio::time::Instant::now() + interval;
            let notify = self.ingress_notify();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!(instance = %self.id(), "control channel closed");
                            return Ok(());
                        }
                        let s = *rx.borrow_and_update();
                        if s.stopped || s.frozen {
                            break;
                        }
                    }
                    _ = notify.notified() => {
                        let soon = tokio::time::Instant::now() + self.config().scheduler.min_interval();
                        deadline = deadline.min(soon);
                    }
                }
            }
        }
        info!(instance = %self.id(), tick = self.last_tick(), "tick loop stopped");
        Ok(())
    }
}
