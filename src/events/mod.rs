//! Engine events and the sinks that carry them out.
//!
//! - `EngineEvent`: typed events emitted once per notable occurrence
//! - `EventSink`: non-blocking publish contract
//! - `BroadcastSink`: `tokio::sync::broadcast` fan-out for observers
//! - `RecordingSink`: in-memory capture for tests and the demo binary
//!
//! The engine buffers a tick's events and publishes them only after the
//! tick's write set commits, so observers never see events for state that
//! was rolled back.

use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::scheduler::Criticality;
use crate::engine::InstanceId;
use crate::entity::lifecycle::EntityFate;
use crate::model::{EntityId, StabilityState};
use crate::phases::redistribution::Contributors;
use crate::phases::{FlipSubject, Phase};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// A node or entity crossed its threshold.
    ThresholdFlip {
        instance: InstanceId,
        tick: u64,
        phase: Phase,
        subject: FlipSubject,
        was_active: bool,
        now_active: bool,
        /// Contributing links with their precedence shares. Empty for
        /// injection flips and deactivations.
        contributors: Contributors,
    },
    /// Once per committed tick.
    TickSummary {
        instance: InstanceId,
        tick: u64,
        total_energy: f64,
        injected: f64,
        energy_moved: f64,
        branching_ratio: f64,
        smoothed_branching_ratio: f64,
        criticality: Criticality,
        active_nodes: usize,
        active_entities: usize,
        workspace_size: usize,
    },
    LifecycleTransition {
        instance: InstanceId,
        tick: u64,
        entity: EntityId,
        from: StabilityState,
        to: EntityFate,
        quality: f64,
    },
}

impl EngineEvent {
    pub fn tick(&self) -> u64 {
        match self {
            EngineEvent::ThresholdFlip { tick, .. }
            | EngineEvent::TickSummary { tick, .. }
            | EngineEvent::LifecycleTransition { tick, .. } => *tick,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ThresholdFlip { .. } => "threshold_flip",
            EngineEvent::TickSummary { .. } => "tick_summary",
            EngineEvent::LifecycleTransition { .. } => "lifecycle_transition",
        }
    }
}

/// Where the engine publishes events. Publishing must never block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

// ============================================================================
// Sinks
// ============================================================================

/// Fan-out to any number of subscribers.
///
/// Fire-and-forget: with no subscribers events are dropped; a lagging
/// subscriber loses the oldest events rather than slowing the engine.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        let tick = event.tick();
        if let Ok(n) = self.sender.send(event) {
            debug!(kind, tick, subscribers = n, "event published");
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: EngineEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish(&self, event: EngineEvent) {
        (**self).publish(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    fn flip(tick: u64) -> EngineEvent {
        EngineEvent::ThresholdFlip {
            instance: InstanceId::new("test"),
            tick,
            phase: Phase::Injection,
            subject: FlipSubject::Node(NodeId(1)),
            was_active: false,
            now_active: true,
            contributors: Contributors::new(),
        }
    }

    #[test]
    fn test_publish_without_subscriber_is_silent() {
        let sink = BroadcastSink::default();
        sink.publish(flip(1));
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn test_every_subscriber_receives() {
        let sink = BroadcastSink::default();
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();
        sink.publish(flip(3));
        assert_eq!(rx1.try_recv().unwrap().tick(), 3);
        assert_eq!(rx2.try_recv().unwrap().tick(), 3);
    }

    #[test]
    fn test_recording_sink_drains() {
        let sink = RecordingSink::new();
        sink.publish(flip(1));
        sink.publish(flip(2));
        assert_eq!(sink.drain().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(flip(7)).unwrap();
        assert_eq!(json["event"], "threshold_flip");
        assert_eq!(json["subject"]["kind"], "node");
        assert_eq!(json["tick"], 7);
    }
}
