//! Operational control of one engine: freeze, resume, stop and the tick
//! multiplier. Backed by a `tokio::sync::watch` channel so the tick loop
//! can wait on changes without polling.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    pub frozen: bool,
    pub stopped: bool,
    /// Stretches the adaptive interval; 1.0 leaves it unchanged.
    pub tick_multiplier: f64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self { frozen: false, stopped: false, tick_multiplier: 1.0 }
    }
}

/// Cloneable handle; every clone controls the same engine.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn is_frozen(&self) -> bool {
        self.tx.borrow().frozen
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().stopped
    }

    pub fn tick_multiplier(&self) -> f64 {
        self.tx.borrow().tick_multiplier
    }

    /// Suspend at the next phase boundary.
    pub fn freeze(&self) {
        if self.tx.send_if_modified(|s| !std::mem::replace(&mut s.frozen, true)) {
            info!("engine frozen");
        }
    }

    pub fn resume(&self) {
        if self.tx.send_if_modified(|s| std::mem::replace(&mut s.frozen, false)) {
            info!("engine resumed");
        }
    }

    /// Ask the tick loop to exit after the in-flight tick.
    pub fn stop(&self) {
        self.tx.send_if_modified(|s| !std::mem::replace(&mut s.stopped, true));
    }

    pub fn set_tick_multiplier(&self, multiplier: f64) -> Result<()> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(Error::ControlError(format!("tick multiplier must be positive, got {multiplier}")));
        }
        self.tx.send_modify(|s| s.tick_multiplier = multiplier);
        info!(multiplier, "tick multiplier set");
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }

    /// Wait until the engine is not frozen (or is stopped).
    pub async fn wait_until_runnable(&self) -> ControlState {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| !s.frozen || s.stopped).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_freeze_resume_toggles() {
        let c = ControlHandle::new();
        assert!(!c.is_frozen());
        c.freeze();
        assert!(c.clone().is_frozen(), "clones share state");
        c.resume();
        assert!(!c.is_frozen());
    }

    #[test]
    fn test_multiplier_must_be_positive() {
        let c = ControlHandle::new();
        assert!(c.set_tick_multiplier(0.0).is_err());
        assert!(c.set_tick_multiplier(f64::NAN).is_err());
        c.set_tick_multiplier(2.5).unwrap();
        assert_eq!(c.tick_multiplier(), 2.5);
    }

    #[tokio::test]
    async fn test_wait_until_runnable_wakes_on_resume() {
        let c = ControlHandle::new();
        c.freeze();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_until_runnable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        c.resume();
        let state = waiter.await.unwrap();
        assert!(!state.frozen);
    }
}
