//! Binary stream assembly.
//!
//! Binary frames carry opaque payloads (uploads, media) correlated to a
//! logical request by UUID. The table lives inside one connection's router,
//! so closing the connection drops every in-flight stream with it.
//!
//! Chunked transfers append in arrival order with the `final` bit closing
//! the stream; a non-chunked frame is a one-shot stream. Compressed frames
//! are inflated as they arrive.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parleyproto::{compress, BinaryFrame, Compression};
use serde_json::Value;
use uuid::Uuid;

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Completed,
    Cancelled,
}

struct StreamSession {
    buffer: BytesMut,
    metadata: Value,
    chunks: u64,
    state: StreamState,
}

/// What one append achieved.
#[derive(Debug)]
pub struct StreamProgress {
    pub chunks: u64,
    pub total_bytes: usize,
    pub completed: bool,
}

/// Stream assembly failures; the router answers them on the frame's
/// correlation id.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream {0} exceeds the message size limit")]
    Overflow(Uuid),
    #[error("stream {0} already completed")]
    AlreadyCompleted(Uuid),
    #[error("failed to decompress stream chunk: {0}")]
    Decompress(#[from] parleyproto::CompressError),
}

/// In-flight binary streams for one connection.
pub struct StreamTable {
    streams: DashMap<Uuid, StreamSession>,
    max_bytes: usize,
    compression: Compression,
}

impl StreamTable {
    pub fn new(max_bytes: usize, compression: Compression) -> Self {
        Self {
            streams: DashMap::new(),
            max_bytes,
            compression,
        }
    }

    /// Fold a binary frame into its stream, opening it on first sight.
    pub fn append(&self, frame: &BinaryFrame) -> Result<StreamProgress, StreamError> {
        let payload = if frame.flags.compressed() {
            Bytes::from(compress::decompress(&frame.payload, self.compression)?)
        } else {
            frame.payload.clone()
        };

        let mut stream = self
            .streams
            .entry(frame.correlation_id)
            .or_insert_with(|| StreamSession {
                buffer: BytesMut::new(),
                metadata: frame.metadata.clone(),
                chunks: 0,
                state: StreamState::Active,
            });

        if stream.state != StreamState::Active {
            return Err(StreamError::AlreadyCompleted(frame.correlation_id));
        }

        if stream.buffer.len() + payload.len() > self.max_bytes {
            stream.state = StreamState::Cancelled;
            stream.buffer.clear();
            return Err(StreamError::Overflow(frame.correlation_id));
        }

        stream.buffer.extend_from_slice(&payload);
        stream.chunks += 1;

        // A non-chunked frame completes immediately; chunked transfers wait
        // for the final bit.
        let completed = !frame.flags.chunked() || frame.flags.is_final();
        if completed {
            stream.state = StreamState::Completed;
        }

        Ok(StreamProgress {
            chunks: stream.chunks,
            total_bytes: stream.buffer.len(),
            completed,
        })
    }

    /// Claim a completed stream's payload and metadata.
    pub fn take_completed(&self, correlation_id: Uuid) -> Option<(Value, Bytes)> {
        let completed = self
            .streams
            .get(&correlation_id)
            .map(|stream| stream.state == StreamState::Completed)?;
        if !completed {
            return None;
        }
        self.streams
            .remove(&correlation_id)
            .map(|(_, stream)| (stream.metadata, stream.buffer.freeze()))
    }

    pub fn active_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|stream| stream.state == StreamState::Active)
            .count()
    }
}
