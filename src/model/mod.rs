//! # Activation Graph Model
//!
//! Plain records that cross every boundary: store ↔ working copy ↔ phases ↔ events.
//!
//! Design rule: this module is pure data. No I/O, no state, no async.
//! Relationships between nodes and entities are explicit edge records
//! ([`Membership`], [`Boundary`]), never collections embedded in a record.

pub mod node;
pub mod link;
pub mod entity;
pub mod membership;
pub mod hunger;
pub mod vector;

pub use node::{Node, NodeId, Scope};
pub use link::{Link, LinkId, LinkTrace, StrideDirection};
pub use entity::{
    ActivationLevel, Entity, EntityId, EntityKind, EntityOrigin, LifecycleStreaks,
    StabilityState,
};
pub use membership::{Boundary, Membership};
pub use hunger::{GateVector, Hunger, HUNGER_COUNT};
pub use vector::{Affect, Embedding, cosine, ema};
