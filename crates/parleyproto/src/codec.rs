//! Text codec for the native v2 envelope.
//!
//! A transport message carries either one frame (a JSON object) or a batch
//! (a JSON array of 1..max_batch frames). Decoding is best-effort: valid
//! elements are returned alongside per-index diagnostics for invalid ones,
//! so a partially bad batch still makes progress.
//!
//! The codec also owns the message size cap and the compressed-payload path.
//! The size cap applies to the *uncompressed* serialized form on both
//! directions; the encoder refuses oversized frames before compressing.

use crate::compress::{self, CompressError, Compression};
use crate::Frame;
use serde::{Deserialize, Serialize};

/// Default cap on a single transport message, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default cap on frames per batch.
pub const DEFAULT_MAX_BATCH: usize = 50;

/// Default payload size at which compression kicks in.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

/// Codec tuning knobs, read from the daemon config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub max_message_bytes: usize,
    pub max_batch: usize,
    pub compression: Compression,
    pub compression_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_batch: DEFAULT_MAX_BATCH,
            compression: Compression::None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Errors from encoding or decoding a whole transport message.
///
/// Per-element batch failures are not errors; they come back as
/// [`BatchDiag`] entries in the [`DecodeOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Message of {size} bytes exceeds size limit of {limit} bytes")]
    ExceedsSizeLimit { size: usize, limit: usize },
    #[error("Malformed JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Batch of {len} frames exceeds maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error("Empty batch")]
    EmptyBatch,
    #[error("Frame serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error(transparent)]
    Compress(#[from] CompressError),
}

/// A per-index diagnostic for an invalid batch element.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDiag {
    pub index: usize,
    pub reason: String,
}

impl std::fmt::Display for BatchDiag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch[{}]: {}", self.index, self.reason)
    }
}

/// Result of decoding one transport message.
#[derive(Debug)]
pub struct DecodeOutcome {
    /// Frames that decoded cleanly, in wire order.
    pub frames: Vec<Frame>,
    /// Diagnostics for elements that did not.
    pub errors: Vec<BatchDiag>,
    /// Whether the message arrived as a JSON array.
    pub is_batch: bool,
}

/// An encoded outbound message, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// Plain UTF-8 JSON, sent as a text message.
    Text(String),
    /// Compressed JSON, sent as a binary message tagged with the algorithm.
    Compressed { algorithm: Compression, bytes: Vec<u8> },
}

/// Encodes and decodes text-format protocol messages.
#[derive(Debug, Clone, Default)]
pub struct TextCodec {
    config: CodecConfig,
}

impl TextCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// The configured cap on a single message, in bytes.
    pub fn message_size_limit(&self) -> usize {
        self.config.max_message_bytes
    }

    pub fn is_within_size_limit(&self, size: usize) -> bool {
        size <= self.config.max_message_bytes
    }

    pub fn max_batch(&self) -> usize {
        self.config.max_batch
    }

    /// Serialize a single frame, enforcing the size cap.
    pub fn encode_frame(&self, frame: &Frame) -> Result<String, CodecError> {
        let text = serde_json::to_string(frame).map_err(CodecError::Serialize)?;
        self.check_size(text.len())?;
        Ok(text)
    }

    /// Serialize a batch of frames, enforcing the batch cap and size cap.
    ///
    /// A single-element batch is encoded as the bare object; decoders accept
    /// both forms.
    pub fn encode_batch(&self, frames: &[Frame]) -> Result<String, CodecError> {
        match frames {
            [] => Err(CodecError::EmptyBatch),
            [single] => self.encode_frame(single),
            many if many.len() > self.config.max_batch => Err(CodecError::BatchTooLarge {
                len: many.len(),
                max: self.config.max_batch,
            }),
            many => {
                let text = serde_json::to_string(many).map_err(CodecError::Serialize)?;
                self.check_size(text.len())?;
                Ok(text)
            }
        }
    }

    /// Serialize a batch for the transport, compressing at/above the
    /// configured threshold.
    ///
    /// `override_algorithm` replaces the configured choice for this call.
    /// The size cap is enforced on the uncompressed serialization; a frame
    /// that is too large is refused before compression.
    pub fn encode_outbound(
        &self,
        frames: &[Frame],
        override_algorithm: Option<Compression>,
    ) -> Result<Encoded, CodecError> {
        let text = self.encode_batch(frames)?;
        let algorithm = override_algorithm.unwrap_or(self.config.compression);

        if algorithm == Compression::None || text.len() < self.config.compression_threshold {
            return Ok(Encoded::Text(text));
        }

        let bytes = compress::compress(text.as_bytes(), algorithm)?;
        Ok(Encoded::Compressed { algorithm, bytes })
    }

    /// Decode one text message into frames plus per-index diagnostics.
    ///
    /// Fails outright only for transport-level problems: the size cap, a
    /// top-level parse failure, or a batch over the cap. Invalid elements
    /// inside a parseable batch are reported per index and do not abort the
    /// rest.
    pub fn decode(&self, text: &str) -> Result<DecodeOutcome, CodecError> {
        self.check_size(text.len())?;

        let value: serde_json::Value = serde_json::from_str(text).map_err(CodecError::Parse)?;

        match value {
            serde_json::Value::Array(elements) => {
                if elements.is_empty() {
                    return Err(CodecError::EmptyBatch);
                }
                if elements.len() > self.config.max_batch {
                    return Err(CodecError::BatchTooLarge {
                        len: elements.len(),
                        max: self.config.max_batch,
                    });
                }

                let mut frames = Vec::with_capacity(elements.len());
                let mut errors = Vec::new();
                for (index, element) in elements.into_iter().enumerate() {
                    match serde_json::from_value::<Frame>(element) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => errors.push(BatchDiag {
                            index,
                            reason: e.to_string(),
                        }),
                    }
                }

                Ok(DecodeOutcome {
                    frames,
                    errors,
                    is_batch: true,
                })
            }
            other => {
                let frame = serde_json::from_value::<Frame>(other).map_err(CodecError::Parse)?;
                Ok(DecodeOutcome {
                    frames: vec![frame],
                    errors: Vec::new(),
                    is_batch: false,
                })
            }
        }
    }

    /// Decode a compressed text message.
    ///
    /// The size cap applies to the decompressed form.
    pub fn decode_compressed(
        &self,
        bytes: &[u8],
        algorithm: Compression,
    ) -> Result<DecodeOutcome, CodecError> {
        let raw = compress::decompress(bytes, algorithm)?;
        self.check_size(raw.len())?;
        let text = String::from_utf8(raw)
            .map_err(|e| CodecError::Parse(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e,
            ))))?;
        self.decode(&text)
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if !self.is_within_size_limit(size) {
            return Err(CodecError::ExceedsSizeLimit {
                size,
                limit: self.config.max_message_bytes,
            });
        }
        Ok(())
    }
}
