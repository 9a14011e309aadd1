//! Value envelope: JSON serialization, optional gzip compression with a
//! double-compression guard, and the legacy base64 wrapping.

use crate::core::error::{CairnError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

/// Gzip magic number.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Prepended to payloads that were already gzip-compressed by the caller.
pub const PRECOMPRESSED_MARKER: [u8; 2] = [0x1f, 0x8c];
/// Payloads at or above this size are compressed. Sized below the request
/// ceiling of networked stores.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 6 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    threshold: usize,
    legacy_base64: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            legacy_base64: false,
        }
    }
}

impl Codec {
    /// Codec for stores whose wire format cannot carry raw binary.
    pub fn legacy() -> Self {
        Self {
            legacy_base64: true,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_legacy_base64(mut self, legacy: bool) -> Self {
        self.legacy_base64 = legacy;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn encode_to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| CairnError::BadParameter(format!("failed to encode value: {e}")))?;
        let packed = self.compress(&raw)?;
        if self.legacy_base64 {
            return Ok(BASE64.encode(packed).into_bytes());
        }
        Ok(packed)
    }

    pub fn decode_from_bytes<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let unwrapped;
        let data = if self.legacy_base64 {
            unwrapped = BASE64
                .decode(data)
                .map_err(|e| CairnError::BadParameter(format!("malformed base64 value: {e}")))?;
            unwrapped.as_slice()
        } else {
            data
        };
        let raw = decompress(data)?;
        serde_json::from_slice(&raw)
            .map_err(|e| CairnError::BadParameter(format!("failed to decode value: {e}")))
    }

    /// String form of [`Codec::encode_to_bytes`]: always base64 of the byte
    /// encoding, regardless of legacy mode.
    pub fn encode_to_string<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let bytes = self.with_legacy_base64(false).encode_to_bytes(value)?;
        Ok(BASE64.encode(bytes))
    }

    pub fn decode_from_str<T: DeserializeOwned>(&self, data: &str) -> Result<T> {
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|e| CairnError::BadParameter(format!("malformed base64 value: {e}")))?;
        self.with_legacy_base64(false).decode_from_bytes(&bytes)
    }

    /// Compresses `data` when it reaches the threshold.
    ///
    /// Input that already looks compressed (gzip magic or the marker itself)
    /// is prefixed with [`PRECOMPRESSED_MARKER`] instead, so that
    /// [`decompress`] hands it back untouched.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if looks_compressed(data) {
            let mut out = Vec::with_capacity(data.len() + 2);
            out.extend_from_slice(&PRECOMPRESSED_MARKER);
            out.extend_from_slice(data);
            return Ok(out);
        }
        if data.len() < self.threshold {
            return Ok(data.to_vec());
        }
        let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
        enc.write_all(data)?;
        Ok(enc.finish()?)
    }
}

fn looks_compressed(data: &[u8]) -> bool {
    data.len() >= 2 && (data[..2] == GZIP_MAGIC || data[..2] == PRECOMPRESSED_MARKER)
}

/// Reverses [`Codec::compress`]. Input under two bytes, or without either
/// magic prefix, is returned as is.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 2 {
        return Ok(data.to_vec());
    }
    if data[..2] == PRECOMPRESSED_MARKER {
        return Ok(data[2..].to_vec());
    }
    if data[..2] != GZIP_MAGIC {
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CairnError::BadParameter(format!("malformed compressed value: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        blob: Vec<u8>,
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn round_trips_small_empty_and_large_payloads() {
        let codec = Codec::default();
        let large = vec![7u8; DEFAULT_COMPRESSION_THRESHOLD + 1024];
        for input in [Vec::new(), vec![0x1f], b"hello".to_vec(), large] {
            let packed = codec.compress(&input).unwrap();
            assert_eq!(decompress(&packed).unwrap(), input);
        }
    }

    #[test]
    fn large_payloads_are_gzipped() {
        let codec = Codec::default().with_threshold(16);
        let packed = codec.compress(&[b'a'; 4096]).unwrap();
        assert_eq!(packed[..2], GZIP_MAGIC);
        assert!(packed.len() < 4096);
    }

    #[test]
    fn precompressed_input_is_guarded_not_recompressed() {
        let codec = Codec::default().with_threshold(0);
        let already = gzip(b"payload compressed upstream");
        let packed = codec.compress(&already).unwrap();
        assert_eq!(packed[..2], PRECOMPRESSED_MARKER);
        assert_eq!(&packed[2..], already.as_slice());
        assert_eq!(decompress(&packed).unwrap(), already);
    }

    #[test]
    fn marker_prefixed_raw_input_survives() {
        let codec = Codec::default();
        let input = vec![0x1f, 0x8c, 1, 2, 3];
        assert_eq!(decompress(&codec.compress(&input).unwrap()).unwrap(), input);
    }

    #[test]
    fn typed_values_round_trip_in_both_modes() {
        let value = Sample {
            name: "node-1".to_string(),
            blob: vec![0, 1, 2, 255],
        };
        for codec in [Codec::default(), Codec::legacy(), Codec::default().with_threshold(0)] {
            let bytes = codec.encode_to_bytes(&value).unwrap();
            let back: Sample = codec.decode_from_bytes(&bytes).unwrap();
            assert_eq!(back, value);
        }

        let codec = Codec::default();
        let s = codec.encode_to_string(&value).unwrap();
        assert!(s.is_ascii());
        let back: Sample = codec.decode_from_str(&s).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn legacy_values_are_ascii() {
        let bytes = Codec::legacy().encode_to_bytes(&vec![0u8, 200, 255]).unwrap();
        assert!(bytes.is_ascii());
    }

    #[test]
    fn malformed_input_is_bad_parameter() {
        let codec = Codec::default();
        let err = codec.decode_from_bytes::<Sample>(b"{not json").unwrap_err();
        assert!(err.is_bad_parameter());

        let err = codec.decode_from_bytes::<Sample>(&[0x1f, 0x8b, 0, 0]).unwrap_err();
        assert!(err.is_bad_parameter());

        let err = Codec::legacy().decode_from_bytes::<Sample>(b"***").unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
