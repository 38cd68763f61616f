//! Scripted in-memory cluster API for tests and local development.
//!
//! Allocation listings are served from a queue of scripted responses; once
//! the queue is drained the last successful listing is repeated, which is
//! what a quiet cluster looks like. Streams replay scripted chunks and then
//! close, fail, or hang until cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use allocsync_id::{AllocationId, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::allocation::{Allocation, FileInfo, LogType, StreamFrame};
use crate::client::{ClusterApi, FileRequest, LogRequest};
use crate::error::ApiError;
use crate::signal::Signal;
use crate::stream::{failed_stream, frame_channel, FrameSink, FrameStream, DEFAULT_FRAME_BUFFER};

/// How a scripted stream ends after its chunks are delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// Close cleanly.
    Close,
    /// Report a transport error.
    Fail(ApiError),
    /// Stay open until cancelled.
    Hang,
}

/// Chunks to replay for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamScript {
    pub chunks: Vec<Bytes>,
    pub end: StreamEnd,
}

impl StreamScript {
    /// Chunks followed by a clean close.
    pub fn closing<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            end: StreamEnd::Close,
        }
    }

    /// Replace how the stream ends.
    pub fn ending(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }
}

/// In-memory [`ClusterApi`].
#[derive(Default)]
pub struct MockClusterApi {
    listings: Mutex<VecDeque<Result<Vec<Allocation>, ApiError>>>,
    last_listing: Mutex<Vec<Allocation>>,
    known: Mutex<HashMap<AllocationId, Allocation>>,
    files: Mutex<HashMap<(AllocationId, String), FileInfo>>,
    scripts: Mutex<HashMap<String, StreamScript>>,
    log_requests: Mutex<Vec<LogRequest>>,
    list_calls: AtomicUsize,
}

fn log_key(alloc_id: &AllocationId, task: &str, log_type: LogType) -> String {
    format!("logs/{alloc_id}/{task}/{log_type}")
}

fn file_key(alloc_id: &AllocationId, path: &str) -> String {
    format!("file/{alloc_id}/{path}")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful listing.
    pub fn push_allocations(&self, allocations: Vec<Allocation>) {
        let mut known = lock(&self.known);
        for alloc in &allocations {
            known.insert(alloc.id.clone(), alloc.clone());
        }
        lock(&self.listings).push_back(Ok(allocations));
    }

    /// Queue a failed listing.
    pub fn push_error(&self, err: ApiError) {
        lock(&self.listings).push_back(Err(err));
    }

    /// Register metadata for a file.
    pub fn set_file_info(&self, alloc_id: &AllocationId, path: &str, info: FileInfo) {
        lock(&self.files).insert((alloc_id.clone(), path.to_string()), info);
    }

    /// Script a task log stream.
    pub fn set_log_script(
        &self,
        alloc_id: &AllocationId,
        task: &str,
        log_type: LogType,
        script: StreamScript,
    ) {
        lock(&self.scripts).insert(log_key(alloc_id, task, log_type), script);
    }

    /// Script a file stream.
    pub fn set_file_script(&self, alloc_id: &AllocationId, path: &str, script: StreamScript) {
        lock(&self.scripts).insert(file_key(alloc_id, path), script);
    }

    /// Number of listing calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every log request received, in order.
    pub fn log_requests(&self) -> Vec<LogRequest> {
        lock(&self.log_requests).clone()
    }

    fn replay(&self, key: String, file: String, start: i64, cancel: Signal) -> FrameStream {
        let Some(script) = lock(&self.scripts).get(&key).cloned() else {
            return failed_stream(ApiError::NotFound(key));
        };

        let (sink, stream) = frame_channel(DEFAULT_FRAME_BUFFER, cancel);
        tokio::spawn(replay_script(script, file, start, sink));
        stream
    }
}

async fn replay_script(script: StreamScript, file: String, start: i64, mut sink: FrameSink) {
    let mut offset = start;
    for chunk in script.chunks {
        offset += chunk.len() as i64;
        if !sink.send(StreamFrame::new(offset, chunk, file.clone())).await {
            debug!(file = %file, "[MOCK] Stream stopped early");
            return;
        }
    }

    match script.end {
        StreamEnd::Close => {}
        StreamEnd::Fail(err) => sink.fail(err).await,
        StreamEnd::Hang => sink.cancelled().await,
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_node_allocations(&self, node_id: &NodeId) -> Result<Vec<Allocation>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let next = lock(&self.listings).pop_front();
        let result = match next {
            Some(Ok(allocations)) => {
                *lock(&self.last_listing) = allocations.clone();
                Ok(allocations)
            }
            Some(Err(e)) => Err(e),
            None => Ok(lock(&self.last_listing).clone()),
        };

        debug!(node_id = %node_id, ok = result.is_ok(), "[MOCK] Listing allocations");
        result
    }

    async fn allocation(&self, id: &AllocationId) -> Result<Allocation, ApiError> {
        lock(&self.known)
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("allocation {id}")))
    }

    async fn stat_file(&self, alloc_id: &AllocationId, path: &str) -> Result<FileInfo, ApiError> {
        lock(&self.files)
            .get(&(alloc_id.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{alloc_id}/{path}")))
    }

    fn stream_logs(&self, request: LogRequest, cancel: Signal) -> FrameStream {
        let key = log_key(&request.alloc_id, &request.task, request.log_type);
        let file = format!("alloc/logs/{}.{}.0", request.task, request.log_type);
        let start = request.offset;
        lock(&self.log_requests).push(request);
        self.replay(key, file, start, cancel)
    }

    fn stream_file(&self, request: FileRequest, cancel: Signal) -> FrameStream {
        let key = file_key(&request.alloc_id, &request.path);
        self.replay(key, request.path, request.offset, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::ClientStatus;
    use crate::signal;

    fn alloc(id: &str) -> Allocation {
        Allocation {
            id: AllocationId::parse(id).unwrap(),
            name: format!("job.group[{id}]"),
            node_id: NodeId::parse("node-1").unwrap(),
            job_id: "job".to_string(),
            task_group: "group".to_string(),
            client_status: ClientStatus::Running,
            tasks: vec!["web".to_string()],
        }
    }

    #[tokio::test]
    async fn test_listing_repeats_last_success() {
        let api = MockClusterApi::new();
        let node = NodeId::parse("node-1").unwrap();

        api.push_allocations(vec![alloc("a1")]);
        api.push_error(ApiError::Network("down".to_string()));

        assert_eq!(api.list_node_allocations(&node).await.unwrap().len(), 1);
        assert!(api.list_node_allocations(&node).await.is_err());
        assert_eq!(api.list_node_allocations(&node).await.unwrap().len(), 1);
        assert_eq!(api.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_allocation_lookup() {
        let api = MockClusterApi::new();
        api.push_allocations(vec![alloc("a1")]);

        let found = api.allocation(&AllocationId::parse("a1").unwrap()).await.unwrap();
        assert_eq!(found.id.as_str(), "a1");

        let missing = api.allocation(&AllocationId::parse("a2").unwrap()).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unscripted_stream_fails() {
        let api = MockClusterApi::new();
        let request = FileRequest {
            alloc_id: AllocationId::parse("a1").unwrap(),
            path: "alloc/data.txt".to_string(),
            origin: Default::default(),
            offset: 0,
        };

        let mut stream = api.stream_file(request, signal::never());
        assert!(matches!(stream.next().await, Some(Err(ApiError::NotFound(_)))));
    }
}
