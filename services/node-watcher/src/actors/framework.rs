//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages and making requests
//! - `spawn_actor` for running an actor on its own task

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::signal::{self, Signal};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// An actor owns its state and processes messages one at a time.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message. Returns `false` to stop the actor.
    async fn handle(&mut self, msg: Self::Message) -> bool;
}

// =============================================================================
// Errors
// =============================================================================

/// Errors seen by callers talking to an actor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// The actor dropped a request without replying.
    #[error("actor dropped the reply")]
    NoReply,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Send a message carrying a reply channel and wait for the answer.
    pub async fn request<R, F>(&self, build: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::NoReply)
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Spawn an actor on its own task.
///
/// The actor runs until it asks to stop, every handle is dropped, or
/// `shutdown` is raised.
pub fn spawn_actor<A: Actor>(
    actor: A,
    mailbox_size: usize,
    shutdown: Signal,
) -> (ActorHandle<A::Message>, JoinHandle<()>) {
    let actor_id = format!("{}_{}", actor.name(), next_actor_id());
    let (tx, rx) = mpsc::channel(mailbox_size);

    info!(actor_id = %actor_id, "Spawned actor");

    let task = tokio::spawn(run_actor_loop(actor, rx, shutdown, actor_id.clone()));

    (ActorHandle { tx, actor_id }, task)
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: Signal,
    actor_id: String,
) {
    let mut messages_processed: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = signal::raised(&mut shutdown) => {
                info!(actor_id = %actor_id, "Actor received shutdown signal");
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                messages_processed += 1;
                if !actor.handle(msg).await {
                    info!(actor_id = %actor_id, "Actor requested stop");
                    break;
                }
            }
        }
    }

    info!(actor_id = %actor_id, messages_processed, "Actor stopped");
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
