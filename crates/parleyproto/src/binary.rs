//! Binary frame format for opaque payloads (uploads, media).
//!
//! ## Wire Format
//!
//! A binary frame is a single transport message with a 22-byte fixed header
//! followed by variable-width metadata and payload:
//!
//! ```text
//! offset  size     field
//!   0     1B       version (== 1)
//!   1     1B       flags (bit0 compressed, bit1 chunked, bit2 final)
//!   2     16B      correlation id (UUID bytes)
//!  18     4B       meta_len (big-endian u32)
//!  22     meta_len metadata (UTF-8 JSON object)
//!  ...             payload (rest of buffer)
//! ```
//!
//! The correlation id links the frame to an in-flight request; chunked
//! transfers carry the same id across frames with the `final` bit set on the
//! last one.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Protocol version - bump on breaking changes.
pub const BINARY_VERSION: u8 = 1;

/// Size of the fixed header before metadata.
pub const FIXED_HEADER_LEN: usize = 22;

/// Header flag bits. Bits 3..7 are reserved and ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryFlags(pub u8);

impl BinaryFlags {
    pub const COMPRESSED: u8 = 0b0000_0001;
    pub const CHUNKED: u8 = 0b0000_0010;
    pub const FINAL: u8 = 0b0000_0100;

    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn chunked(self) -> bool {
        self.0 & Self::CHUNKED != 0
    }

    pub fn is_final(self) -> bool {
        self.0 & Self::FINAL != 0
    }

    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }

    pub fn with_chunked(mut self) -> Self {
        self.0 |= Self::CHUNKED;
        self
    }

    pub fn with_final(mut self) -> Self {
        self.0 |= Self::FINAL;
        self
    }
}

/// A parsed binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub flags: BinaryFlags,
    pub correlation_id: Uuid,
    pub metadata: serde_json::Value,
    pub payload: Bytes,
}

/// Errors during binary frame encoding/decoding.
///
/// Decode failures are distinct per cause so the router can report precisely
/// what was wrong with the buffer.
#[derive(Debug, thiserror::Error)]
pub enum BinaryError {
    #[error("Buffer too short for fixed header: expected {FIXED_HEADER_LEN} bytes, got {0}")]
    HeaderTooShort(usize),
    #[error("Unsupported binary frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("Binary frame metadata truncated: header claims {meta_len} bytes, {available} available")]
    MetadataTruncated { meta_len: usize, available: usize },
    #[error("Binary frame metadata is not valid JSON: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

impl BinaryFrame {
    /// Create a frame with the given correlation id and metadata.
    pub fn new(correlation_id: Uuid, metadata: serde_json::Value, payload: Bytes) -> Self {
        Self {
            flags: BinaryFlags::default(),
            correlation_id,
            metadata,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: BinaryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Serialize to a single wire buffer.
    pub fn encode(&self) -> Result<Bytes, BinaryError> {
        let metadata = serde_json::to_vec(&self.metadata)?;
        let mut buf =
            BytesMut::with_capacity(FIXED_HEADER_LEN + metadata.len() + self.payload.len());
        buf.put_u8(BINARY_VERSION);
        buf.put_u8(self.flags.0);
        buf.put_slice(self.correlation_id.as_bytes());
        buf.put_u32(metadata.len() as u32);
        buf.put_slice(&metadata);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a wire buffer into a frame.
    pub fn decode(buf: &[u8]) -> Result<Self, BinaryError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(BinaryError::HeaderTooShort(buf.len()));
        }

        let version = buf[0];
        if version != BINARY_VERSION {
            return Err(BinaryError::UnsupportedVersion(version));
        }

        let flags = BinaryFlags(buf[1]);

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&buf[2..18]);
        let correlation_id = Uuid::from_bytes(id_bytes);

        let meta_len = u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]) as usize;
        let available = buf.len() - FIXED_HEADER_LEN;
        if meta_len > available {
            return Err(BinaryError::MetadataTruncated { meta_len, available });
        }

        let meta_end = FIXED_HEADER_LEN + meta_len;
        let metadata: serde_json::Value = serde_json::from_slice(&buf[FIXED_HEADER_LEN..meta_end])?;
        let payload = Bytes::copy_from_slice(&buf[meta_end..]);

        Ok(Self {
            flags,
            correlation_id,
            metadata,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_with_payload() {
        // Scenario: 100k upload payload with a known correlation id.
        let correlation_id: Uuid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let metadata = serde_json::json!({"method": "file.upload"});
        let payload = Bytes::from(vec![0xAB; 100_000]);

        let frame = BinaryFrame::new(correlation_id, metadata.clone(), payload.clone());
        let encoded = frame.encode().unwrap();
        let decoded = BinaryFrame::decode(&encoded).unwrap();

        assert_eq!(decoded.correlation_id, correlation_id);
        assert_eq!(decoded.metadata, metadata);
        assert_eq!(decoded.payload, payload);
        assert!(!decoded.flags.compressed());
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let correlation_id = Uuid::new_v4();
        let frame = BinaryFrame::new(correlation_id, serde_json::json!({}), Bytes::new())
            .with_flags(BinaryFlags::default().with_chunked().with_final());
        let encoded = frame.encode().unwrap();

        assert_eq!(encoded[0], 1);
        assert_eq!(encoded[1], BinaryFlags::CHUNKED | BinaryFlags::FINAL);
        assert_eq!(&encoded[2..18], correlation_id.as_bytes());
        // metadata is "{}", 2 bytes, big-endian
        assert_eq!(&encoded[18..22], &[0, 0, 0, 2]);
        assert_eq!(&encoded[22..24], b"{}");
    }

    #[test]
    fn short_buffer_rejected() {
        let err = BinaryFrame::decode(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, BinaryError::HeaderTooShort(3)));
    }

    #[test]
    fn unsupported_version_rejected() {
        let frame = BinaryFrame::new(Uuid::new_v4(), serde_json::json!({}), Bytes::new());
        let mut encoded = frame.encode().unwrap().to_vec();
        encoded[0] = 9;
        let err = BinaryFrame::decode(&encoded).unwrap_err();
        assert!(matches!(err, BinaryError::UnsupportedVersion(9)));
    }

    #[test]
    fn truncated_metadata_rejected() {
        let frame = BinaryFrame::new(
            Uuid::new_v4(),
            serde_json::json!({"method": "file.upload"}),
            Bytes::new(),
        );
        let encoded = frame.encode().unwrap();
        // Cut the buffer inside the metadata region.
        let err = BinaryFrame::decode(&encoded[..FIXED_HEADER_LEN + 4]).unwrap_err();
        assert!(matches!(err, BinaryError::MetadataTruncated { .. }));
    }

    #[test]
    fn empty_payload_allowed() {
        let frame = BinaryFrame::new(Uuid::new_v4(), serde_json::json!({"done": true}), Bytes::new());
        let decoded = BinaryFrame::decode(&frame.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn flag_bits() {
        let flags = BinaryFlags::default().with_compressed().with_final();
        assert!(flags.compressed());
        assert!(!flags.chunked());
        assert!(flags.is_final());
    }
}
