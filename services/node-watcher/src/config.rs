//! Configuration for the node watcher.

use std::time::Duration;

use allocsync_id::NodeId;
use allocsync_reconcile::DEFAULT_POLL_INTERVAL;
use anyhow::{anyhow, bail, Context, Result};

use crate::reconciler::{OverflowPolicy, ReconcilerConfig};

/// Default control plane address.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:4646";

/// Default capacity of each event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Node watcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node whose allocations are watched.
    pub node_id: NodeId,

    /// Control plane API URL.
    pub api_url: String,

    /// ACL token sent with every request.
    pub api_token: Option<String>,

    /// Interval between reconciliation ticks.
    pub poll_interval: Duration,

    /// Capacity of each event channel.
    pub event_buffer: usize,

    /// Behavior when an event channel is full.
    pub overflow_policy: OverflowPolicy,

    /// Measure stdout/stderr sizes for every added allocation.
    pub measure_log_sizes: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("ALLOCSYNC_NODE_ID")
            .ok_or_else(|| anyhow!("ALLOCSYNC_NODE_ID is required"))?
            .parse::<NodeId>()
            .context("invalid ALLOCSYNC_NODE_ID")?;

        let api_url = lookup("ALLOCSYNC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let api_token = lookup("ALLOCSYNC_API_TOKEN").filter(|t| !t.trim().is_empty());

        let poll_interval = match lookup("ALLOCSYNC_POLL_INTERVAL") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid ALLOCSYNC_POLL_INTERVAL: {raw}"))?;
                if secs == 0 {
                    bail!("ALLOCSYNC_POLL_INTERVAL must be positive");
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_POLL_INTERVAL,
        };

        let event_buffer = match lookup("ALLOCSYNC_EVENT_BUFFER") {
            Some(raw) => {
                let size: usize = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid ALLOCSYNC_EVENT_BUFFER: {raw}"))?;
                if size == 0 {
                    bail!("ALLOCSYNC_EVENT_BUFFER must be positive");
                }
                size
            }
            None => DEFAULT_EVENT_BUFFER,
        };

        let overflow_policy = match lookup("ALLOCSYNC_OVERFLOW_POLICY") {
            Some(raw) => raw.parse::<OverflowPolicy>().map_err(|e| anyhow!(e))?,
            None => OverflowPolicy::default(),
        };

        let measure_log_sizes = lookup("ALLOCSYNC_MEASURE_LOGS")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_level = lookup("ALLOCSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_id,
            api_url,
            api_token,
            poll_interval,
            event_buffer,
            overflow_policy,
            measure_log_sizes,
            log_level,
        })
    }

    /// Settings for the reconciliation loop.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: self.poll_interval,
            overflow: self.overflow_policy,
        }
    }
}
