//! Streaming JSON body reader for matchmaking requests.
//!
//! Chunks are appended in arrival order to a buffer that is only allocated
//! once a second chunk shows up; a body that arrives as a single chunk is
//! decoded straight from that chunk. Decoding happens once, on the final
//! chunk, and a decode failure is reported as `None` so the caller can
//! answer with its own error.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::Value;

/// Why a body could not be read to the end.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    /// The client went away (or the transport failed) mid-body
    #[error("request body stream failed: {0}")]
    Stream(#[from] axum::Error),
}

/// Outcome of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState {
    Pending,
    /// Final chunk seen; `None` when the body is not valid JSON
    Complete(Option<Value>),
}

/// Accumulates body chunks and decodes JSON on the final one.
#[derive(Debug)]
pub struct StreamingBodyReader {
    buffer: Option<BytesMut>,
    received: usize,
    limit: usize,
}

impl StreamingBodyReader {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: None,
            received: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: Bytes, is_last: bool) -> Result<ReadState, BodyError> {
        self.received += chunk.len();
        if self.received > self.limit {
            self.buffer = None;
            return Err(BodyError::TooLarge { limit: self.limit });
        }

        if !is_last {
            self.buffer
                .get_or_insert_with(|| BytesMut::with_capacity(chunk.len() * 2))
                .extend_from_slice(&chunk);
            return Ok(ReadState::Pending);
        }

        let decoded = match self.buffer.take() {
            None => serde_json::from_slice(&chunk).ok(),
            Some(mut buffer) => {
                buffer.extend_from_slice(&chunk);
                serde_json::from_slice(&buffer).ok()
            }
        };
        Ok(ReadState::Complete(decoded))
    }

    /// Bytes buffered so far (0 until a second chunk arrives).
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, BytesMut::len)
    }
}

/// Read `body` to the end and decode it as JSON.
///
/// Resolves exactly once: `Ok(Some(json))`, `Ok(None)` when the bytes are not
/// valid JSON, or an error when the body is too large or the stream failed.
pub async fn read_json_body(body: Body, limit: usize) -> Result<Option<Value>, BodyError> {
    let mut reader = StreamingBodyReader::new(limit);
    let mut stream = body.into_data_stream();

    // One chunk of lookahead tells us which chunk is the final one.
    let mut current = stream.next().await;
    loop {
        match current {
            None => {
                return match reader.push(Bytes::new(), true)? {
                    ReadState::Complete(value) => Ok(value),
                    ReadState::Pending => Ok(None),
                };
            }
            Some(Err(e)) => return Err(BodyError::Stream(e)),
            Some(Ok(chunk)) => {
                let next = stream.next().await;
                let is_last = next.is_none();
                if let ReadState::Complete(value) = reader.push(chunk, is_last)? {
                    return Ok(value);
                }
                current = next;
            }
        }
    }
}
