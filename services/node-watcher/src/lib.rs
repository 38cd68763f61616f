//! allocsync Node Watcher Library
//!
//! The node watcher follows the allocations placed on one cluster node. It
//! polls the control plane, diffs what it finds against the allocations it
//! already tracks, and publishes `Added`/`Removed` events to consumers. It
//! also relays task logs and allocation files as byte-frame streams.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler ──snapshot/replace──▶ TrackedSetActor
//!     │
//!     ├──▶ added sink
//!     ├──▶ removed sink
//!     └──▶ error sink
//!
//! StreamRelay ──▶ ClusterApi ──▶ FrameSink ═══▶ FrameStream
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the tracked set owner
//! - `client`: `ClusterApi` boundary and its HTTP implementation
//! - `reconciler`: Poll-diff-publish loop
//! - `relay`: Log size measurement, single-frame read, and streaming
//! - `stream`: Frame/error channel pairs with cooperative cancellation

pub mod actors;
pub mod allocation;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod relay;
pub mod signal;
pub mod stream;

// Exposed for integration tests and local development
pub mod mock;

// Re-export commonly used types
pub use allocation::{Allocation, AllocationEvent, ClientStatus, FileInfo, LogType, StreamFrame};
pub use client::{ClusterApi, HttpClusterClient};
pub use error::{ApiError, ApiErrorKind, RelayError};
pub use mock::MockClusterApi;
pub use reconciler::{OverflowPolicy, Reconciler, ReconcilerConfig, TickOutcome};
pub use relay::StreamRelay;
