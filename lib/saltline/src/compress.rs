use crate::shared::{ErrorType, NetworkError, NetworkResult};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

/// A pluggable payload codec. The engine only consumes this capability; the framing
/// (a little endian `u16` uncompressed length prefix and the header flag bit) is the
/// peer's responsibility.
pub trait Compressor {
    /// Compresses `plain` into `out`. Returns false when the codec cannot beat the
    /// original size, in which case `out` contents are unspecified.
    fn compress(&mut self, plain: &[u8], out: &mut Vec<u8>) -> bool;

    /// Inflates `compressed` into `out`; anything other than exactly `expected` bytes
    /// of output is an error.
    fn decompress(&mut self, compressed: &[u8], expected: usize, out: &mut Vec<u8>) -> NetworkResult<()>;

    fn name(&self) -> &'static str;
}

/// Deflate codec backed by flate2.
pub struct Deflate {
    level: Compression,
}

impl Deflate {
    #[inline]
    pub fn new() -> Deflate {
        Deflate {
            level: Compression::fast(),
        }
    }

    #[inline]
    pub fn with_level(level: u32) -> Deflate {
        Deflate {
            level: Compression::new(level),
        }
    }
}

impl Compressor for Deflate {
    fn compress(&mut self, plain: &[u8], out: &mut Vec<u8>) -> bool {
        out.clear();

        let mut encoder = DeflateEncoder::new(plain, self.level);

        match encoder.read_to_end(out) {
            Ok(_) => out.len() < plain.len(),
            Err(_) => false,
        }
    }

    fn decompress(&mut self, compressed: &[u8], expected: usize, out: &mut Vec<u8>) -> NetworkResult<()> {
        out.clear();
        out.reserve(expected);

        let mut decoder = DeflateDecoder::new(compressed).take(expected as u64 + 1);

        decoder
            .read_to_end(out)
            .map_err(|_| NetworkError::Fatal(ErrorType::Compression))?;

        if out.len() != expected {
            return Err(NetworkError::Fatal(ErrorType::Compression));
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "deflate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut codec = Deflate::new();
        let plain: Vec<u8> = std::iter::repeat(b"saltline ".iter().copied())
            .take(64)
            .flatten()
            .collect();

        let mut compressed = Vec::new();
        assert!(codec.compress(&plain, &mut compressed));
        assert!(compressed.len() < plain.len());

        let mut inflated = Vec::new();
        codec.decompress(&compressed, plain.len(), &mut inflated).unwrap();
        assert_eq!(inflated, plain);
    }

    #[test]
    fn test_incompressible_input_reports_failure() {
        let mut codec = Deflate::new();

        // High entropy input cannot shrink
        let plain: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        let mut compressed = Vec::new();
        assert!(!codec.compress(&plain, &mut compressed));
    }

    #[test]
    fn test_decompress_length_mismatch() {
        let mut codec = Deflate::new();

        let mut compressed = Vec::new();
        assert!(codec.compress(&[7u8; 100], &mut compressed));

        let mut inflated = Vec::new();
        assert!(codec.decompress(&compressed, 99, &mut inflated).is_err());
    }
}
