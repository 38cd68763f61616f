//! Frame/error channel pairs used for log and file streaming.
//!
//! A producer (the HTTP adapter or the mock) holds a [`FrameSink`] and a
//! consumer holds the matching [`FrameStream`]. The contract between them:
//!
//! - Frames are delivered in order on the frame channel
//! - A transport failure is delivered on the error channel and ends the stream
//! - Dropping the sink without reporting an error is a clean end of stream
//! - Cancellation is cooperative: the sink observes the signal and stops
//!   producing; the consumer observes it and reports `Cancelled`
//!
//! ```text
//! Opened -> Streaming -> Closed | Failed | Cancelled
//! ```

use tokio::sync::mpsc;

use crate::allocation::StreamFrame;
use crate::error::ApiError;
use crate::signal::{self, Signal};

/// Default number of frames buffered between producer and consumer.
pub const DEFAULT_FRAME_BUFFER: usize = 16;

/// Lifecycle of a single stream, as seen by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frame received yet.
    Opened,
    /// At least one frame received.
    Streaming,
    /// The producer finished without error.
    Closed,
    /// The producer reported a transport error.
    Failed,
    /// The cancellation signal was raised.
    Cancelled,
}

impl StreamState {
    /// Returns true once no more frames will be yielded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Closed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Create a connected sink/stream pair.
pub fn frame_channel(capacity: usize, cancel: Signal) -> (FrameSink, FrameStream) {
    let (frame_tx, frame_rx) = mpsc::channel(capacity);
    let (error_tx, error_rx) = mpsc::channel(1);

    let sink = FrameSink {
        frames: frame_tx,
        errors: error_tx,
        cancel: cancel.clone(),
    };
    let stream = FrameStream {
        frames: frame_rx,
        errors: error_rx,
        cancel,
        state: StreamState::Opened,
        bytes_received: 0,
    };

    (sink, stream)
}

/// Producer half of a stream.
pub struct FrameSink {
    frames: mpsc::Sender<StreamFrame>,
    errors: mpsc::Sender<ApiError>,
    cancel: Signal,
}

impl FrameSink {
    /// Deliver a frame.
    ///
    /// Returns `false` when the producer should stop: the consumer went away
    /// or cancellation was requested.
    pub async fn send(&mut self, frame: StreamFrame) -> bool {
        if self.is_cancelled() {
            return false;
        }

        tokio::select! {
            result = self.frames.send(frame) => result.is_ok(),
            _ = signal::raised(&mut self.cancel) => false,
        }
    }

    /// Report a transport error and end the stream.
    pub async fn fail(self, err: ApiError) {
        // Queued before the frame sender drops, so the consumer sees it
        // before it observes the closed frame channel.
        let _ = self.errors.send(err).await;
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        signal::raised(&mut self.cancel).await;
    }
}

/// Consumer half of a stream.
#[derive(Debug)]
pub struct FrameStream {
    frames: mpsc::Receiver<StreamFrame>,
    errors: mpsc::Receiver<ApiError>,
    cancel: Signal,
    state: StreamState,
    bytes_received: u64,
}

impl FrameStream {
    /// Receive the next frame or the terminal error.
    ///
    /// Returns `None` once the stream closed cleanly or was cancelled; the
    /// distinction is available through [`FrameStream::state`].
    pub async fn next(&mut self) -> Option<Result<StreamFrame, ApiError>> {
        if self.state.is_terminal() {
            return None;
        }

        if *self.cancel.borrow() {
            self.state = StreamState::Cancelled;
            return None;
        }

        let Self {
            frames,
            errors,
            cancel,
            ..
        } = self;

        // Frames are polled first so everything queued ahead of an error is
        // delivered before the error itself.
        let received = tokio::select! {
            biased;

            frame = frames.recv() => Received::Frame(frame),
            Some(err) = errors.recv() => Received::Error(err),
            _ = signal::raised(cancel) => Received::Cancelled,
        };

        match received {
            Received::Frame(Some(frame)) => {
                self.state = StreamState::Streaming;
                self.bytes_received += frame.len() as u64;
                Some(Ok(frame))
            }
            Received::Frame(None) => match self.errors.try_recv() {
                Ok(err) => {
                    self.state = StreamState::Failed;
                    Some(Err(err))
                }
                Err(_) => {
                    self.state = StreamState::Closed;
                    None
                }
            },
            Received::Error(err) => {
                self.state = StreamState::Failed;
                Some(Err(err))
            }
            Received::Cancelled => {
                self.state = StreamState::Cancelled;
                None
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Total payload bytes yielded so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Split into the raw frame and error channels.
    pub fn into_channels(self) -> (mpsc::Receiver<StreamFrame>, mpsc::Receiver<ApiError>) {
        (self.frames, self.errors)
    }
}

enum Received {
    Frame(Option<StreamFrame>),
    Error(ApiError),
    Cancelled,
}

/// Build a stream that has already failed.
pub fn failed_stream(err: ApiError) -> FrameStream {
    let (sink, stream) = frame_channel(1, signal::never());
    // Capacity 1 and no other sender: the send cannot block.
    let _ = sink.errors.try_send(err);
    stream
}
