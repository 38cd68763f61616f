//! Cluster control plane access.
//!
//! [`ClusterApi`] is the only boundary the reconciler and the relay depend
//! on. [`HttpClusterClient`] implements it against the control plane's HTTP
//! API:
//! - Listing the allocations placed on a node
//! - Fetching a single allocation
//! - Stat'ing and streaming files in an allocation directory
//! - Streaming task logs

use std::time::Duration;

use allocsync_id::{AllocationId, NodeId};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::allocation::{Allocation, FileInfo, LogType, Origin};
use crate::codec::FrameDecoder;
use crate::config::Config;
use crate::error::ApiError;
use crate::signal::Signal;
use crate::stream::{frame_channel, FrameSink, FrameStream, DEFAULT_FRAME_BUFFER};

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Parameters for a task log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub alloc_id: AllocationId,
    pub task: String,
    pub log_type: LogType,
    /// Keep the stream open and deliver new output as it is written.
    pub follow: bool,
    pub origin: Origin,
    pub offset: i64,
}

/// Parameters for a file stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub alloc_id: AllocationId,
    /// Path relative to the allocation directory.
    pub path: String,
    pub origin: Origin,
    pub offset: i64,
}

/// Read-only view of the cluster control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every allocation placed on a node, in any status.
    async fn list_node_allocations(&self, node_id: &NodeId) -> Result<Vec<Allocation>, ApiError>;

    /// Fetch a single allocation.
    async fn allocation(&self, id: &AllocationId) -> Result<Allocation, ApiError>;

    /// Stat a file in an allocation directory.
    async fn stat_file(&self, alloc_id: &AllocationId, path: &str) -> Result<FileInfo, ApiError>;

    /// Open a task log stream.
    ///
    /// Returns immediately; frames are produced in the background until the
    /// source ends, fails, or `cancel` is raised. Must be called from within
    /// a Tokio runtime.
    fn stream_logs(&self, request: LogRequest, cancel: Signal) -> FrameStream;

    /// Open a file stream. Same contract as [`ClusterApi::stream_logs`].
    fn stream_file(&self, request: FileRequest, cancel: Signal) -> FrameStream;
}

/// HTTP implementation of [`ClusterApi`].
#[derive(Clone)]
pub struct HttpClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpClusterClient {
    /// Create a new client from configuration.
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        Self::with_base_url(&config.api_url, config.api_token.clone())
    }

    /// Create a client for an explicit base URL.
    pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        // No overall timeout on the client itself: follow streams stay open
        // indefinitely. Unary calls set a per-request timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            request_timeout: Duration::from_secs(30),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.get(url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        debug!(path = %path, "Requesting");

        let response = self
            .get(path)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, path = %path, "Request failed");
            return Err(ApiError::from_status(status, &body));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn open_stream(&self, path: String, query: Vec<(&'static str, String)>, cancel: Signal) -> FrameStream {
        let (sink, stream) = frame_channel(DEFAULT_FRAME_BUFFER, cancel);
        let request = self.get(&path).query(&query);

        tokio::spawn(pump_frames(path, request, sink));

        stream
    }
}

/// Drive one streaming request until it ends, fails, or is cancelled.
async fn pump_frames(path: String, request: reqwest::RequestBuilder, mut sink: FrameSink) {
    let response = tokio::select! {
        response = request.send() => response,
        _ = sink.cancelled() => {
            debug!(path = %path, "Stream cancelled before response");
            return;
        }
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            sink.fail(e.into()).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, path = %path, "Stream request failed");
        sink.fail(ApiError::from_status(status, &body)).await;
        return;
    }

    debug!(path = %path, "Stream opened");

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = sink.cancelled() => {
                debug!(path = %path, "Stream cancelled");
                return;
            }
        };

        let Some(chunk) = chunk else { break };

        let frames = match chunk.map_err(ApiError::from).and_then(|c| decoder.push(&c)) {
            Ok(frames) => frames,
            Err(e) => {
                sink.fail(e).await;
                return;
            }
        };

        for frame in frames {
            if !sink.send(frame).await {
                debug!(path = %path, "Stream consumer gone");
                return;
            }
        }
    }

    if let Err(e) = decoder.finish() {
        sink.fail(e).await;
        return;
    }

    debug!(path = %path, "Stream ended");
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn list_node_allocations(&self, node_id: &NodeId) -> Result<Vec<Allocation>, ApiError> {
        let path = format!("/v1/node/{}/allocations", node_id);
        let allocations: Vec<Allocation> = self.get_json(&path, &[]).await?;

        debug!(
            node_id = %node_id,
            allocation_count = allocations.len(),
            "Fetched node allocations"
        );

        Ok(allocations)
    }

    async fn allocation(&self, id: &AllocationId) -> Result<Allocation, ApiError> {
        let path = format!("/v1/allocation/{}", id);
        self.get_json(&path, &[]).await
    }

    async fn stat_file(&self, alloc_id: &AllocationId, path: &str) -> Result<FileInfo, ApiError> {
        let url_path = format!("/v1/client/fs/stat/{}", alloc_id);
        self.get_json(&url_path, &[("path", path.to_string())])
            .await
    }

    fn stream_logs(&self, request: LogRequest, cancel: Signal) -> FrameStream {
        let path = format!("/v1/client/fs/logs/{}", request.alloc_id);
        let query = vec![
            ("task", request.task),
            ("type", request.log_type.as_str().to_string()),
            ("origin", request.origin.as_str().to_string()),
            ("offset", request.offset.to_string()),
            ("follow", request.follow.to_string()),
        ];

        self.open_stream(path, query, cancel)
    }

    fn stream_file(&self, request: FileRequest, cancel: Signal) -> FrameStream {
        let path = format!("/v1/client/fs/stream/{}", request.alloc_id);
        let query = vec![
            ("path", request.path),
            ("origin", request.origin.as_str().to_string()),
            ("offset", request.offset.to_string()),
            ("follow", "true".to_string()),
        ];

        self.open_stream(path, query, cancel)
    }
}
