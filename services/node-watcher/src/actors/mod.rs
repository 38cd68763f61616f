//! Actor framework for the node watcher.
//!
//! A lightweight actor framework used to give shared state a single owner.
//! State lives inside one task; everything else talks to it through a
//! bounded mailbox instead of a lock.
//!
//! ## Actor Types
//!
//! - `TrackedSetActor`: Owns the reconciler's baseline of live allocations

mod framework;
mod tracked_set;

pub use framework::{spawn_actor, Actor, ActorError, ActorHandle, Message};
pub use tracked_set::{TrackedSet, TrackedSetActor, TrackedSetMessage, TrackedSnapshot};
