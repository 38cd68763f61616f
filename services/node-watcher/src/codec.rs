//! Incremental decoder for streamed file and log frames.
//!
//! The control plane streams a sequence of concatenated JSON objects:
//!
//! ```text
//! {"Data":"aGVsbG8=","File":"alloc/logs/web.stdout.0","Offset":5}{}{"FileEvent":"file truncated",...}
//! ```
//!
//! `Data` is base64. An empty object is a heartbeat and is dropped. Objects
//! may be split at arbitrary byte boundaries across HTTP chunks.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::allocation::{FileEvent, StreamFrame};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct FrameWire {
    #[serde(rename = "Data", default)]
    data: Option<String>,

    #[serde(rename = "Offset", default)]
    offset: i64,

    #[serde(rename = "File", default)]
    file: String,

    #[serde(rename = "FileEvent", default)]
    file_event: String,
}

/// Buffers raw bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamFrame>, ApiError> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        let mut iter = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<FrameWire>();

        loop {
            match iter.next() {
                Some(Ok(wire)) => {
                    consumed = iter.byte_offset();
                    if let Some(frame) = decode_frame(wire)? {
                        frames.push(frame);
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    consumed = self.buffer.len();
                    break;
                }
            }
        }

        self.buffer.drain(..consumed);
        Ok(frames)
    }

    /// Signal end of input; fails if a partial frame is still buffered.
    pub fn finish(self) -> Result<(), ApiError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(ApiError::MalformedResponse(format!(
                "stream ended inside a frame ({} bytes buffered)",
                self.buffer.len()
            )))
        }
    }
}

fn decode_frame(wire: FrameWire) -> Result<Option<StreamFrame>, ApiError> {
    let file_event = FileEvent::from_wire(&wire.file_event);
    let data = match wire.data.as_deref() {
        Some(encoded) if !encoded.is_empty() => STANDARD
            .decode(encoded)
            .map_err(|e| ApiError::MalformedResponse(format!("invalid frame data: {e}")))?,
        _ => Vec::new(),
    };

    if data.is_empty() && file_event.is_none() {
        return Ok(None);
    }

    Ok(Some(StreamFrame {
        offset: wire.offset,
        data: data.into(),
        file: wire.file,
        file_event,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;

    #[test]
    fn test_decodes_concatenated_frames() {
        let mut decoder = FrameDecoder::new();
        let body = br#"{"Data":"aGVsbG8=","File":"web.stdout.0","Offset":5}{}{"Data":"IQ==","File":"web.stdout.0","Offset":6}"#;

        let frames = decoder.push(body).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_ref(), b"hello");
        assert_eq!(frames[0].offset, 5);
        assert_eq!(frames[1].data.as_ref(), b"!");
        decoder.finish().unwrap();
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let body = br#"{"Data":"aGVsbG8=","File":"web.stdout.0","Offset":5}"#;
        let (head, tail) = body.split_at(17);

        assert!(decoder.push(head).unwrap().is_empty());
        let frames = decoder.push(tail).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].file, "web.stdout.0");
    }

    #[test]
    fn test_file_event_frame_kept_without_data() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push(br#"{"File":"web.stdout.0","FileEvent":"file truncated","Offset":0}"#)
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
        assert_eq!(frames[0].file_event, Some(FileEvent::Truncated));
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(br#"{"Data":"***","Offset":1}"#).unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::MalformedResponse);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(b"[1,2]").unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::MalformedResponse);
    }

    #[test]
    fn test_truncated_body_fails_on_finish() {
        let mut decoder = FrameDecoder::new();
        decoder.push(br#"{"Data":"aGVs"#).unwrap();
        assert!(decoder.finish().is_err());
    }
}
