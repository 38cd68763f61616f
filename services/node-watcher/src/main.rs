//! allocsync Node Watcher
//!
//! Watches the allocations placed on one cluster node and logs every
//! membership change.
//!
//! ## Architecture
//!
//! - **Tracked Set**: Actor owning the allocations currently believed live
//! - **Reconciler**: Polls the control plane and publishes added/removed events
//! - **Event Logger**: Consumes the event sinks; optionally measures log sizes
//!   of newly added allocations through the stream relay

use std::sync::Arc;

use allocsync_node_watcher::actors::TrackedSet;
use allocsync_node_watcher::allocation::{AllocationEvent, LogType};
use allocsync_node_watcher::client::{ClusterApi, HttpClusterClient};
use allocsync_node_watcher::config::Config;
use allocsync_node_watcher::reconciler::{event_channels, EventStreams, Reconciler};
use allocsync_node_watcher::relay::StreamRelay;
use allocsync_node_watcher::signal::{self, Signal};
use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting allocsync node watcher");
    info!(
        node_id = %config.node_id,
        api_url = %config.api_url,
        poll_interval_secs = config.poll_interval.as_secs(),
        event_buffer = config.event_buffer,
        overflow = ?config.overflow_policy,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api: Arc<dyn ClusterApi> = Arc::new(HttpClusterClient::new(&config)?);
    let relay = StreamRelay::new(Arc::clone(&api));

    let (tracked, tracked_handle) = TrackedSet::spawn(shutdown_rx.clone());
    let (sinks, streams) = event_channels(config.event_buffer);

    // Start the event logger
    let logger_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        let sizes = config.measure_log_sizes.then(|| relay.clone());
        async move { run_event_logger(streams, sizes, shutdown_rx).await }
    });

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        config.node_id.clone(),
        api,
        tracked,
        sinks,
        config.reconciler(),
    );
    let mut reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    let mut reconciler_running = true;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            reconciler_running = false;
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            } else {
                info!("Reconciler exited");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let mut workers = Vec::with_capacity(3);
    // A finished JoinHandle must not be polled again.
    if reconciler_running {
        workers.push(("reconciler", reconciler_handle));
    }
    workers.push(("event_logger", logger_handle));
    workers.push(("tracked_set", tracked_handle));

    for (name, handle) in workers {
        if let Err(e) = handle.await {
            warn!(worker = name, error = %e, "Worker did not shut down cleanly");
        }
    }

    info!("Node watcher shutdown complete");
    Ok(())
}

/// Log every event until shutdown or until all sinks close.
async fn run_event_logger(mut streams: EventStreams, sizes: Option<StreamRelay>, mut shutdown: Signal) {
    let (mut added_open, mut removed_open, mut errors_open) = (true, true, true);

    while added_open || removed_open || errors_open {
        tokio::select! {
            biased;

            _ = signal::raised(&mut shutdown) => break,

            event = streams.added.recv(), if added_open => match event {
                Some(event) => on_added(event, sizes.as_ref()).await,
                None => added_open = false,
            },

            event = streams.removed.recv(), if removed_open => match event {
                Some(event) => {
                    let alloc = event.allocation();
                    info!(alloc_id = %alloc.id, name = %alloc.name, "Allocation removed");
                }
                None => removed_open = false,
            },

            err = streams.errors.recv(), if errors_open => match err {
                Some(e) => warn!(error = %e, kind = %e.kind(), "Allocation fetch failed"),
                None => errors_open = false,
            },
        }
    }
}

async fn on_added(event: AllocationEvent, sizes: Option<&StreamRelay>) {
    let alloc = event.into_allocation();
    info!(
        alloc_id = %alloc.id,
        name = %alloc.name,
        job_id = %alloc.job_id,
        status = %alloc.client_status,
        "Allocation added"
    );

    let Some(relay) = sizes else {
        return;
    };

    for task in &alloc.tasks {
        for log_type in [LogType::Stdout, LogType::Stderr] {
            match relay.log_size(log_type, &alloc, task, 0).await {
                Ok(bytes) => info!(
                    alloc_id = %alloc.id,
                    task = %task,
                    log_type = %log_type,
                    bytes,
                    "Log size"
                ),
                Err(e) => warn!(
                    alloc_id = %alloc.id,
                    task = %task,
                    log_type = %log_type,
                    error = %e,
                    "Log size measurement failed"
                ),
            }
        }
    }
}
