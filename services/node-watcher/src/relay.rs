//! Stream relay for allocation logs and files.
//!
//! Thin helpers over [`ClusterApi`] streams: a size count that drains a log,
//! a single-frame read, and follow-mode pass-throughs. All reads start from
//! the beginning of the file.

use std::sync::Arc;

use allocsync_id::AllocationId;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::allocation::{Allocation, FileInfo, LogType, Origin, StreamFrame};
use crate::client::{ClusterApi, FileRequest, LogRequest};
use crate::error::{ApiError, RelayError};
use crate::signal::{self, Signal};
use crate::stream::{FrameStream, StreamState};

/// Outcome of a single multiplexed receive.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    /// A frame carrying this many payload bytes.
    Frame(usize),
    /// The stream ended cleanly.
    Closed,
    /// The stream ended with a transport error.
    Failed(ApiError),
    /// Cancellation was observed.
    Cancelled,
}

/// Read exactly one frame-or-error from a stream.
pub async fn read_stream_frame(stream: &mut FrameStream) -> FrameRead {
    match stream.next().await {
        Some(Ok(frame)) => FrameRead::Frame(frame.len()),
        Some(Err(e)) => FrameRead::Failed(e),
        None if stream.state() == StreamState::Cancelled => FrameRead::Cancelled,
        None => FrameRead::Closed,
    }
}

/// Relay over a cluster API.
#[derive(Clone)]
pub struct StreamRelay {
    api: Arc<dyn ClusterApi>,
}

impl StreamRelay {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Fetch a single allocation by ID.
    pub async fn allocation_info(&self, id: &AllocationId) -> Result<Allocation, ApiError> {
        self.api.allocation(id).await
    }

    /// Count the bytes available in a task log from `offset`.
    ///
    /// On a transport error the bytes counted so far are returned alongside
    /// the error.
    pub async fn log_size(
        &self,
        log_type: LogType,
        alloc: &Allocation,
        task: &str,
        offset: i64,
    ) -> Result<u64, RelayError> {
        let request = log_request(log_type, alloc, task, offset, false);
        let mut stream = self.api.stream_logs(request, signal::never());
        let mut total: u64 = 0;

        loop {
            match read_stream_frame(&mut stream).await {
                FrameRead::Frame(n) => total += n as u64,
                FrameRead::Closed | FrameRead::Cancelled => {
                    debug!(
                        alloc_id = %alloc.id,
                        task = %task,
                        log_type = %log_type,
                        bytes = total,
                        "Log size measured"
                    );
                    return Ok(total);
                }
                FrameRead::Failed(e) => {
                    warn!(
                        alloc_id = %alloc.id,
                        task = %task,
                        log_type = %log_type,
                        bytes_read = total,
                        error = %e,
                        "Log size measurement failed"
                    );
                    return Err(RelayError::Transport {
                        bytes_read: total,
                        source: e,
                    });
                }
            }
        }
    }

    /// Read the first available frame of a task log.
    pub async fn read_log(
        &self,
        log_type: LogType,
        alloc: &Allocation,
        task: &str,
        offset: i64,
    ) -> Result<StreamFrame, RelayError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let request = log_request(log_type, alloc, task, offset, false);
        let mut stream = self.api.stream_logs(request, cancel_rx);

        let result = match stream.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(RelayError::Stream(e)),
            None => Err(RelayError::Empty),
        };

        // The rest of the log is not needed.
        let _ = cancel_tx.send(true);
        result
    }

    /// Follow a task log until `cancel` is raised.
    pub fn stream_log(
        &self,
        log_type: LogType,
        alloc: &Allocation,
        task: &str,
        offset: i64,
        cancel: Signal,
    ) -> FrameStream {
        debug!(alloc_id = %alloc.id, task = %task, log_type = %log_type, offset, "Following log");
        self.api
            .stream_logs(log_request(log_type, alloc, task, offset, true), cancel)
    }

    /// Stat a file in the allocation directory.
    pub async fn stat_file(&self, alloc: &Allocation, path: &str) -> Result<FileInfo, ApiError> {
        self.api.stat_file(&alloc.id, path).await
    }

    /// Follow a file in the allocation directory until `cancel` is raised.
    pub fn stream_file(
        &self,
        alloc: &Allocation,
        path: &str,
        offset: i64,
        cancel: Signal,
    ) -> FrameStream {
        debug!(alloc_id = %alloc.id, path = %path, offset, "Following file");
        let request = FileRequest {
            alloc_id: alloc.id.clone(),
            path: path.to_string(),
            origin: Origin::Start,
            offset,
        };
        self.api.stream_file(request, cancel)
    }
}

fn log_request(
    log_type: LogType,
    alloc: &Allocation,
    task: &str,
    offset: i64,
    follow: bool,
) -> LogRequest {
    LogRequest {
        alloc_id: alloc.id.clone(),
        task: task.to_string(),
        log_type,
        follow,
        origin: Origin::Start,
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{failed_stream, frame_channel};

    #[tokio::test]
    async fn test_read_stream_frame_sequence() {
        let (mut sink, mut stream) = frame_channel(4, signal::never());
        assert!(sink.send(StreamFrame::new(3, &b"abc"[..], "f")).await);
        drop(sink);

        assert_eq!(read_stream_frame(&mut stream).await, FrameRead::Frame(3));
        assert_eq!(read_stream_frame(&mut stream).await, FrameRead::Closed);
    }

    #[tokio::test]
    async fn test_read_stream_frame_failure() {
        let mut stream = failed_stream(ApiError::Network("reset".to_string()));
        assert_eq!(
            read_stream_frame(&mut stream).await,
            FrameRead::Failed(ApiError::Network("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_stream_frame_cancelled() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (_sink, mut stream) = frame_channel(4, cancel_rx);

        cancel_tx.send(true).unwrap();
        assert_eq!(read_stream_frame(&mut stream).await, FrameRead::Cancelled);
    }
}
