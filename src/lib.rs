//! # spread-rs: Activation Spreading over a Persistent Graph
//!
//! A tick-driven engine that moves a bounded scalar "energy" across a
//! directed graph, selects a small workspace of salient entities each tick,
//! and learns long-horizon weights from what it observed.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `GraphStore` is the contract between the engine and persistence
//! 2. **Clean records**: `Node`, `Link`, `Entity`, `Membership`, `Boundary` cross all boundaries
//! 3. **One writer per instance**: a tick works on a private copy and commits it as one batch
//! 4. **Single writer per field**: every trace is written by exactly one phase
//!
//! ## Tick pipeline
//!
//! | Phase | Module | Writes |
//! |-------|--------|--------|
//! | Injection | `phases::stimulus` | node energy |
//! | Redistribution | `phases::redistribution` | node energy, link + boundary traces |
//! | Selection | `phases::workspace` | nothing |
//! | Learning | `phases::learning` | log weights, presence/seat EMAs |
//! | Lifecycle | `entity::lifecycle` | entity state, memberships, boundaries |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spread_rs::{Engine, EngineConfig, MemoryStore, GraphStore, Node, NodeId, StimulusRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> spread_rs::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let id = store.create_node(Node::new(NodeId(0), "kettle").with_threshold(5.0)).await?;
//!
//! let mut engine = Engine::builder(store, "subject-1").config(EngineConfig::default()).build()?;
//! let ingress = engine.ingress();
//! let outcome = ingress.submit(StimulusRequest::node(id, 10.0));
//!
//! let report = engine.tick().await?;
//! println!("tick {} moved {:.2} energy", report.tick, report.energy_moved);
//! println!("{:?}", outcome.await);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod config;
pub mod storage;
pub mod tx;
pub mod index;
pub mod working;
pub mod phases;
pub mod entity;
pub mod events;
pub mod engine;
pub mod export;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    Node, NodeId, Scope, Link, LinkId, LinkTrace, Entity, EntityId, EntityKind,
    StabilityState, Membership, Boundary, GateVector, Hunger,
};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{Filter, GraphSnapshot, GraphStore, IdKind, MemoryStore};
pub use tx::{CommitId, Transaction, TxId, TxMode, WriteSet};

// ============================================================================
// Re-exports: Engine
// ============================================================================

pub use config::{EngineConfig, InvariantMode};
pub use engine::{
    ControlHandle, Engine, EngineBuilder, EngineRegistry, IngressHandle, InstanceId,
    Phase, PhaseObserver, TickProgress, TickReport,
};
pub use events::{BroadcastSink, EngineEvent, EventSink};
pub use phases::stimulus::{InjectionOutcome, StimulusRequest, TargetRef};
pub use phases::workspace::{Workspace, WorkspaceItem};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Retryable store failure (timeouts, contention).
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Non-retryable store failure. The tick aborts; committed state is untouched.
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A redistribution or learning formula produced an out-of-range value.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Control error: {0}")]
    ControlError(String),

    #[error("Tick {tick} failed after {attempts} attempt(s): {source}")]
    TickFailed {
        tick: u64,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientStorage(_) => true,
            Error::TickFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
