//! Payload compression for oversized frames.
//!
//! The codec compresses serialized payloads at or above a configured
//! threshold. `none` is a valid algorithm and short-circuits, so callers can
//! treat compression uniformly. Law: `decompress(compress(b, a), a) == b`
//! for every algorithm `a`.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression algorithm for frame payloads.
///
/// `Deflate` is the zlib-wrapped deflate stream (RFC 1950), matching what
/// HTTP calls `deflate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Deflate,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "deflate" => Ok(Compression::Deflate),
            other => Err(CompressError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Errors from the compression path.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("Unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Compress `data` with the given algorithm. `Compression::None` returns the
/// input unchanged.
pub fn compress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>, CompressError> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(CompressError::Compress)?;
            encoder.finish().map_err(CompressError::Compress)
        }
        Compression::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(CompressError::Compress)?;
            encoder.finish().map_err(CompressError::Compress)
        }
    }
}

/// Decompress `data` produced by [`compress`] with the same algorithm.
pub fn decompress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>, CompressError> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(CompressError::Decompress)?;
            Ok(out)
        }
        Compression::Deflate => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(CompressError::Decompress)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_algorithms() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for algorithm in [Compression::None, Compression::Gzip, Compression::Deflate] {
            let packed = compress(&data, algorithm).unwrap();
            let unpacked = decompress(&packed, algorithm).unwrap();
            assert_eq!(data, unpacked, "roundtrip failed for {:?}", algorithm);
        }
    }

    #[test]
    fn gzip_shrinks_repetitive_input() {
        let data = vec![0xAB; 100_000];
        let packed = compress(&data, Compression::Gzip).unwrap();
        assert!(packed.len() < data.len() / 10);
    }

    #[test]
    fn none_is_identity() {
        let data = b"untouched".to_vec();
        assert_eq!(compress(&data, Compression::None).unwrap(), data);
        assert_eq!(decompress(&data, Compression::None).unwrap(), data);
    }

    #[test]
    fn empty_input_roundtrip() {
        for algorithm in [Compression::Gzip, Compression::Deflate] {
            let packed = compress(&[], algorithm).unwrap();
            assert_eq!(decompress(&packed, algorithm).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn garbage_input_fails() {
        let garbage = b"definitely not a gzip stream";
        assert!(decompress(garbage, Compression::Gzip).is_err());
        assert!(decompress(garbage, Compression::Deflate).is_err());
    }

    #[test]
    fn algorithm_parse() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
    }
}
