//! Tracked set actor - owns the reconciler's baseline of live allocations.
//!
//! Every read and every write of the tracked set goes through this actor's
//! mailbox, so a reader always observes one complete generation: either the
//! sequence before a replacement or the sequence after it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::framework::{spawn_actor, Actor, ActorError, ActorHandle};
use crate::allocation::Allocation;
use crate::signal::Signal;

/// Mailbox size for the tracked set actor.
const MAILBOX_SIZE: usize = 64;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by TrackedSetActor.
#[derive(Debug)]
pub enum TrackedSetMessage {
    /// Read the current generation.
    Snapshot {
        reply_to: oneshot::Sender<TrackedSnapshot>,
    },

    /// Replace the whole sequence, returning the previous generation.
    Replace {
        allocations: Vec<Allocation>,
        reply_to: oneshot::Sender<TrackedSnapshot>,
    },
}

/// One immutable generation of the tracked set.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSnapshot {
    /// Incremented on every replacement; the initial empty set is 0.
    pub generation: u64,

    pub allocations: Arc<[Allocation]>,
}

impl TrackedSnapshot {
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// IDs in tracked order.
    pub fn ids(&self) -> Vec<&str> {
        self.allocations.iter().map(|a| a.id.as_str()).collect()
    }
}

// =============================================================================
// Tracked Set Actor
// =============================================================================

/// Actor owning the tracked set.
pub struct TrackedSetActor {
    current: TrackedSnapshot,
}

impl TrackedSetActor {
    pub fn new(initial: Vec<Allocation>) -> Self {
        Self {
            current: TrackedSnapshot {
                generation: 0,
                allocations: initial.into(),
            },
        }
    }
}

#[async_trait]
impl Actor for TrackedSetActor {
    type Message = TrackedSetMessage;

    fn name(&self) -> &str {
        "tracked_set"
    }

    async fn handle(&mut self, msg: TrackedSetMessage) -> bool {
        match msg {
            TrackedSetMessage::Snapshot { reply_to } => {
                let _ = reply_to.send(self.current.clone());
            }

            TrackedSetMessage::Replace {
                allocations,
                reply_to,
            } => {
                let next = TrackedSnapshot {
                    generation: self.current.generation + 1,
                    allocations: allocations.into(),
                };
                debug!(
                    generation = next.generation,
                    count = next.len(),
                    "Tracked set replaced"
                );
                let previous = std::mem::replace(&mut self.current, next);
                let _ = reply_to.send(previous);
            }
        }

        true
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the tracked set.
#[derive(Clone)]
pub struct TrackedSet {
    handle: ActorHandle<TrackedSetMessage>,
}

impl TrackedSet {
    /// Spawn the owning actor with an empty set.
    pub fn spawn(shutdown: Signal) -> (Self, JoinHandle<()>) {
        Self::spawn_with(Vec::new(), shutdown)
    }

    /// Spawn the owning actor with an initial set.
    pub fn spawn_with(initial: Vec<Allocation>, shutdown: Signal) -> (Self, JoinHandle<()>) {
        let (handle, task) = spawn_actor(TrackedSetActor::new(initial), MAILBOX_SIZE, shutdown);
        (Self { handle }, task)
    }

    /// Read the current generation.
    pub async fn snapshot(&self) -> Result<TrackedSnapshot, ActorError> {
        self.handle
            .request(|reply_to| TrackedSetMessage::Snapshot { reply_to })
            .await
    }

    /// Replace the whole sequence; returns the generation it superseded.
    pub async fn replace(&self, allocations: Vec<Allocation>) -> Result<TrackedSnapshot, ActorError> {
        self.handle
            .request(|reply_to| TrackedSetMessage::Replace {
                allocations,
                reply_to,
            })
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
