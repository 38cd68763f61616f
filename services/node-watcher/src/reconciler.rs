//! Reconciliation loop for tracking the allocations live on a node.
//!
//! Every tick the reconciler:
//! - Snapshots the tracked set
//! - Fetches the node's allocations from the control plane
//! - Keeps only live ones (running or restarting)
//! - Publishes `Added` for new IDs, then `Removed` for vanished IDs
//! - Replaces the tracked set with what it found
//!
//! A failed fetch is reported on the error sink and leaves the tracked set
//! untouched; the next tick tries again.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use allocsync_id::NodeId;
use allocsync_reconcile::{dedupe_by_key, diff_membership, DEFAULT_POLL_INTERVAL};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::actors::{ActorError, TrackedSet};
use crate::allocation::{Allocation, AllocationEvent};
use crate::client::ClusterApi;
use crate::error::ApiError;
use crate::signal::{self, Signal};

/// What to do when an event sink is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the consumer; the loop stalls until it catches up.
    Block,
    /// Wait up to the given duration, then drop the event.
    BlockWithTimeout(Duration),
    /// Drop the event immediately.
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    /// Accepts `block`, `drop-newest`, or `timeout:<millis>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "block" => Ok(Self::Block),
            "drop-newest" => Ok(Self::DropNewest),
            other => {
                let millis = other
                    .strip_prefix("timeout:")
                    .ok_or_else(|| format!("unknown overflow policy: {other}"))?;
                let millis: u64 = millis
                    .parse()
                    .map_err(|_| format!("invalid timeout in overflow policy: {other}"))?;
                if millis == 0 {
                    return Err("overflow timeout must be positive".to_string());
                }
                Ok(Self::BlockWithTimeout(Duration::from_millis(millis)))
            }
        }
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks.
    pub poll_interval: Duration,

    /// Behavior when a sink is full.
    pub overflow: OverflowPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Channels the reconciler publishes to.
#[derive(Clone)]
pub struct EventSinks {
    pub added: mpsc::Sender<AllocationEvent>,
    pub removed: mpsc::Sender<AllocationEvent>,
    pub errors: mpsc::Sender<ApiError>,
}

/// Receiving side of [`EventSinks`].
pub struct EventStreams {
    pub added: mpsc::Receiver<AllocationEvent>,
    pub removed: mpsc::Receiver<AllocationEvent>,
    pub errors: mpsc::Receiver<ApiError>,
}

/// Create bounded sinks with the given capacity each.
pub fn event_channels(capacity: usize) -> (EventSinks, EventStreams) {
    let (added_tx, added_rx) = mpsc::channel(capacity);
    let (removed_tx, removed_rx) = mpsc::channel(capacity);
    let (errors_tx, errors_rx) = mpsc::channel(capacity);

    (
        EventSinks {
            added: added_tx,
            removed: removed_tx,
            errors: errors_tx,
        },
        EventStreams {
            added: added_rx,
            removed: removed_rx,
            errors: errors_rx,
        },
    )
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tracked set was replaced.
    Applied {
        added: usize,
        removed: usize,
        /// Events discarded by the overflow policy or a closed sink.
        dropped: usize,
    },
    /// The fetch failed; nothing changed.
    FetchFailed,
    /// Shutdown was requested mid-tick; the tracked set was left as it was.
    Interrupted,
}

enum Delivery {
    Sent,
    Dropped,
    Interrupted,
}

/// Keep live allocations, first occurrence of each ID only.
pub fn live_allocations(fetched: Vec<Allocation>) -> Vec<Allocation> {
    let live = fetched.into_iter().filter(Allocation::is_live).collect();
    dedupe_by_key(live, |a: &Allocation| &a.id)
}

/// Reconciler for one node.
pub struct Reconciler {
    node_id: NodeId,

    api: Arc<dyn ClusterApi>,

    tracked: TrackedSet,

    sinks: EventSinks,

    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        node_id: NodeId,
        api: Arc<dyn ClusterApi>,
        tracked: TrackedSet,
        sinks: EventSinks,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            node_id,
            api,
            tracked,
            sinks,
            config,
        }
    }

    /// Handle to the tracked set, for readers.
    pub fn tracked(&self) -> &TrackedSet {
        &self.tracked
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// The first tick fires one poll interval after start.
    pub async fn run(&self, mut shutdown: Signal) {
        info!(
            node_id = %self.node_id,
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            overflow = ?self.config.overflow,
            "Starting reconciliation loop"
        );

        let period = self.config.poll_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = signal::raised(&mut shutdown) => {
                    info!(node_id = %self.node_id, "Reconciler shutting down");
                    break;
                }

                _ = interval.tick() => {
                    match self.tick(&mut shutdown).await {
                        Ok(TickOutcome::Interrupted) => {
                            info!(node_id = %self.node_id, "Reconciler interrupted mid-tick");
                            break;
                        }
                        Ok(outcome) => {
                            debug!(node_id = %self.node_id, outcome = ?outcome, "Tick complete");
                        }
                        Err(e) => {
                            error!(node_id = %self.node_id, error = %e, "Tracked set unavailable, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Perform a single tick.
    ///
    /// Only fails if the tracked set actor has gone away.
    pub async fn tick(&self, shutdown: &mut Signal) -> Result<TickOutcome, ActorError> {
        let baseline = self.tracked.snapshot().await?;

        info!(
            node_id = %self.node_id,
            generation = baseline.generation,
            current = ?baseline.ids(),
            "Current allocations"
        );

        let fetched = tokio::select! {
            biased;

            _ = signal::raised(shutdown) => return Ok(TickOutcome::Interrupted),
            fetched = self.api.list_node_allocations(&self.node_id) => fetched,
        };

        let fetched = match fetched {
            Ok(allocations) => allocations,
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    error = %e,
                    kind = %e.kind(),
                    "Failed to fetch allocations"
                );
                return Ok(match self.deliver(&self.sinks.errors, e, shutdown).await {
                    Delivery::Interrupted => TickOutcome::Interrupted,
                    Delivery::Sent | Delivery::Dropped => TickOutcome::FetchFailed,
                });
            }
        };

        let found = live_allocations(fetched);
        let diff = diff_membership(&baseline.allocations, &found, |a: &Allocation| &a.id);

        let added = diff.added.len();
        let removed = diff.removed.len();
        let mut dropped = 0;

        for alloc in diff.added {
            let alloc_id = alloc.id.clone();
            debug!(alloc_id = %alloc_id, "Sending allocation to added channel");
            match self
                .deliver(&self.sinks.added, AllocationEvent::Added(alloc), shutdown)
                .await
            {
                Delivery::Sent => debug!(alloc_id = %alloc_id, "Allocation sent to added channel"),
                Delivery::Dropped => dropped += 1,
                Delivery::Interrupted => return Ok(TickOutcome::Interrupted),
            }
        }

        for alloc in diff.removed {
            let alloc_id = alloc.id.clone();
            debug!(alloc_id = %alloc_id, "Sending allocation to removed channel");
            match self
                .deliver(&self.sinks.removed, AllocationEvent::Removed(alloc), shutdown)
                .await
            {
                Delivery::Sent => debug!(alloc_id = %alloc_id, "Allocation sent to removed channel"),
                Delivery::Dropped => dropped += 1,
                Delivery::Interrupted => return Ok(TickOutcome::Interrupted),
            }
        }

        self.tracked.replace(found).await?;

        if added > 0 || removed > 0 {
            info!(
                node_id = %self.node_id,
                added,
                removed,
                dropped,
                "Allocation membership changed"
            );
        }

        Ok(TickOutcome::Applied {
            added,
            removed,
            dropped,
        })
    }

    /// Send one item according to the overflow policy.
    async fn deliver<T>(&self, tx: &mpsc::Sender<T>, item: T, shutdown: &mut Signal) -> Delivery {
        let sent = match self.config.overflow {
            OverflowPolicy::DropNewest => match tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(node_id = %self.node_id, "Sink full, dropping event");
                    return Delivery::Dropped;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
            },
            OverflowPolicy::Block => tokio::select! {
                biased;

                _ = signal::raised(shutdown) => return Delivery::Interrupted,
                result = tx.send(item) => result.map_err(|_| ()),
            },
            OverflowPolicy::BlockWithTimeout(limit) => tokio::select! {
                biased;

                _ = signal::raised(shutdown) => return Delivery::Interrupted,
                result = tokio::time::timeout(limit, tx.send(item)) => match result {
                    Ok(sent) => sent.map_err(|_| ()),
                    Err(_) => {
                        warn!(
                            node_id = %self.node_id,
                            timeout_ms = limit.as_millis() as u64,
                            "Sink still full after timeout, dropping event"
                        );
                        return Delivery::Dropped;
                    }
                },
            },
        };

        match sent {
            Ok(()) => Delivery::Sent,
            Err(()) => {
                warn!(node_id = %self.node_id, "Sink closed, dropping event");
                Delivery::Dropped
            }
        }
    }
}
