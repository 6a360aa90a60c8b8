//! Registry of running engines, keyed by instance id.
//!
//! Owned and passed around explicitly; there is no process-wide instance.
//! Registration returns a guard that deregisters on drop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::control::ControlHandle;
use super::scheduler::Criticality;
use super::InstanceId;
use crate::{Error, Result};

/// Point-in-time view of one registered engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance: InstanceId,
    pub frozen: bool,
    pub tick_multiplier: f64,
    pub last_tick: u64,
    pub last_interval: Option<Duration>,
    pub criticality: Option<Criticality>,
}

#[derive(Debug)]
struct Entry {
    control: ControlHandle,
    last_tick: u64,
    last_interval: Option<Duration>,
    criticality: Option<Criticality>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    inner: Arc<RwLock<BTreeMap<InstanceId, Entry>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine's control handle. Ids must be unique.
    pub fn register(&self, id: InstanceId, control: ControlHandle) -> Result<RegistrationGuard> {
        let mut map = self.inner.write();
        if map.contains_key(&id) {
            return Err(Error::ControlError(format!("instance {id} is already registered")));
        }
        map.insert(id.clone(), Entry { control, last_tick: 0, last_interval: None, criticality: None });
        info!(instance = %id, "engine registered");
        Ok(RegistrationGuard { registry: self.clone(), id })
    }

    pub fn deregister(&self, id: &InstanceId) -> bool {
        let removed = self.inner.write().remove(id).is_some();
        if removed {
            info!(instance = %id, "engine deregistered");
        }
        removed
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn control(&self, id: &InstanceId) -> Result<ControlHandle> {
        self.inner
            .read()
            .get(id)
            .map(|e| e.control.clone())
            .ok_or_else(|| Error::ControlError(format!("unknown instance {id}")))
    }

    pub fn freeze(&self, id: &InstanceId) -> Result<()> {
        self.control(id)?.freeze();
        Ok(())
    }

    pub fn resume(&self, id: &InstanceId) -> Result<()> {
        self.control(id)?.resume();
        Ok(())
    }

    pub fn set_tick_multiplier(&self, id: &InstanceId, multiplier: f64) -> Result<()> {
        self.control(id)?.set_tick_multiplier(multiplier)
    }

    /// Freeze every registered engine; returns how many.
    pub fn freeze_all(&self) -> usize {
        let map = self.inner.read();
        map.values().for_each(|e| e.control.freeze());
        map.len()
    }

    pub fn resume_all(&self) -> usize {
        let map = self.inner.read();
        map.values().for_each(|e| e.control.resume());
        map.len()
    }

    /// Called by the engine after each committed tick.
    pub fn record_tick(&self, id: &InstanceId, tick: u64, interval: Duration, criticality: Criticality) {
        if let Some(e) = self.inner.write().get_mut(id) {
            e.last_tick = tick;
            e.last_interval = Some(interval);
            e.criticality = Some(criticality);
        }
    }

    pub fn status(&self, id: &InstanceId) -> Option<InstanceStatus> {
        self.inner.read().get(id).map(|e| status(id, e))
    }

    /// Every registered engine, in id order.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.inner.read().iter().map(|(id, e)| status(id, e)).collect()
    }
}

fn status(id: &InstanceId, e: &Entry) -> InstanceStatus {
    let state = e.control.state();
    InstanceStatus {
        instance: id.clone(),
        frozen: state.frozen,
        tick_multiplier: state.tick_multiplier,
        last_tick: e.last_tick,
        last_interval: e.last_interval,
        criticality: e.criticality,
    }
}

/// Deregisters its instance when dropped.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: EngineRegistry,
    id: InstanceId,
}

impl RegistrationGuard {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_unique_and_guarded() {
        let reg = EngineRegistry::new();
        let id = InstanceId::new("alice");
        let guard = reg.register(id.clone(), ControlHandle::new()).unwrap();
        assert!(matches!(reg.register(id.clone(), ControlHandle::new()), Err(Error::ControlError(_))));
        assert!(reg.contains(&id));
        drop(guard);
        assert!(!reg.contains(&id));
    }

    #[test]
    fn test_freeze_all_reaches_every_instance() {
        let reg = EngineRegistry::new();
        let (a, b) = (ControlHandle::new(), ControlHandle::new());
        let _ga = reg.register(InstanceId::new("a"), a.clone()).unwrap();
        let _gb = reg.register(InstanceId::new("b"), b.clone()).unwrap();

        assert_eq!(reg.freeze_all(), 2);
        assert!(a.is_frozen() && b.is_frozen());
        reg.resume(&InstanceId::new("a")).unwrap();
        assert!(!a.is_frozen() && b.is_frozen(), "instances are independent");

        let frozen: Vec<bool> = reg.statuses().iter().map(|s| s.frozen).collect();
        assert_eq!(frozen, vec![false, true]);
        assert!(reg.freeze(&InstanceId::new("missing")).is_err());
    }

    #[test]
    fn test_record_tick_updates_status() {
        let reg = EngineRegistry::new();
        let id = InstanceId::new("x");
        let _g = reg.register(id.clone(), ControlHandle::new()).unwrap();
        reg.record_tick(&id, 4, Duration::from_millis(250), Criticality::Critical);
        let s = reg.status(&id).unwrap();
        assert_eq!(s.last_tick, 4);
        assert_eq!(s.last_interval, Some(Duration::from_millis(250)));
        assert_eq!(s.criticality, Some(Criticality::Critical));
    }
}
