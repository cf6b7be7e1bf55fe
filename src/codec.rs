//! Size-threshold payload compression for queued jobs.
//!
//! Payloads whose serialized JSON exceeds the configured threshold are stored compressed; smaller
//! payloads are stored as-is. Compressed bytes carry their algorithm so a payload written under
//! one configuration still decodes after the configuration changes.

use crate::error::PipelineError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::str::FromStr;

pub const DEFAULT_THRESHOLD_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Gzip,
    Zlib,
    Deflate,
}

impl FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "zlib" => Ok(CompressionAlgorithm::Zlib),
            "deflate" => Ok(CompressionAlgorithm::Deflate),
            other => Err(format!("unsupported compression algorithm {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    pub threshold_bytes: usize,
    pub algorithm: CompressionAlgorithm,
    pub level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WirePayload", try_from = "WirePayload")]
pub enum StoredPayload {
    Plain(Value),
    Compressed {
        algorithm: CompressionAlgorithm,
        bytes: Vec<u8>,
    },
}

impl StoredPayload {
    pub fn is_compressed(&self) -> bool {
        matches!(self, StoredPayload::Compressed { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<CompressionAlgorithm>,
    data: Value,
}

impl From<StoredPayload> for WirePayload {
    fn from(payload: StoredPayload) -> Self {
        match payload {
            StoredPayload::Plain(data) => WirePayload {
                compressed: false,
                algorithm: None,
                data,
            },
            StoredPayload::Compressed { algorithm, bytes } => WirePayload {
                compressed: true,
                algorithm: Some(algorithm),
                data: Value::String(STANDARD.encode(bytes)),
            },
        }
    }
}

impl TryFrom<WirePayload> for StoredPayload {
    type Error = String;

    fn try_from(wire: WirePayload) -> Result<Self, Self::Error> {
        if !wire.compressed {
            return Ok(StoredPayload::Plain(wire.data));
        }
        let Value::String(encoded) = wire.data else {
            return Err("compressed payload data must be a base64 string".to_string());
        };
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| format!("invalid base64 payload: {err}"))?;
        Ok(StoredPayload::Compressed {
            algorithm: wire.algorithm.unwrap_or(CompressionAlgorithm::Gzip),
            bytes,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn compress(&self, payload: &Value) -> Result<StoredPayload, PipelineError> {
        let serialized = serde_json::to_vec(payload)
            .map_err(|err| PipelineError::Codec(format!("serialize payload: {err}")))?;
        if serialized.len() <= self.config.threshold_bytes {
            return Ok(StoredPayload::Plain(payload.clone()));
        }

        let algorithm = self.config.algorithm;
        let level = Compression::new(self.config.level.min(9));
        let bytes = match algorithm {
            CompressionAlgorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(&serialized).map_err(codec_io)?;
                encoder.finish().map_err(codec_io)?
            }
            CompressionAlgorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(&serialized).map_err(codec_io)?;
                encoder.finish().map_err(codec_io)?
            }
            CompressionAlgorithm::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), level);
                encoder.write_all(&serialized).map_err(codec_io)?;
                encoder.finish().map_err(codec_io)?
            }
        };
        tracing::trace!(
            original = serialized.len(),
            compressed = bytes.len(),
            ?algorithm,
            "compressed job payload"
        );
        Ok(StoredPayload::Compressed { algorithm, bytes })
    }

    pub fn decompress(&self, stored: &StoredPayload) -> Result<Value, PipelineError> {
        let (algorithm, bytes) = match stored {
            StoredPayload::Plain(value) => return Ok(value.clone()),
            StoredPayload::Compressed { algorithm, bytes } => (*algorithm, bytes.as_slice()),
        };

        let mut inflated = Vec::with_capacity(bytes.len().saturating_mul(4));
        match algorithm {
            CompressionAlgorithm::Gzip => GzDecoder::new(bytes).read_to_end(&mut inflated),
            CompressionAlgorithm::Zlib => ZlibDecoder::new(bytes).read_to_end(&mut inflated),
            CompressionAlgorithm::Deflate => DeflateDecoder::new(bytes).read_to_end(&mut inflated),
        }
        .map_err(codec_io)?;

        serde_json::from_slice(&inflated)
            .map_err(|err| PipelineError::Codec(format!("decompressed payload is not JSON: {err}")))
    }
}

fn codec_io(err: std::io::Error) -> PipelineError {
    PipelineError::Codec(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn large_payload() -> Value {
        let readings: Vec<Value> = (0..800)
            .map(|i| json!({"sensorId": format!("SNS-{i:04}"), "value": i as f64 * 0.5, "unit": "celsius"}))
            .collect();
        json!({"deviceId": "GW-17", "readings": readings})
    }

    #[test]
    fn small_payload_is_stored_plain() {
        let codec = Codec::default();
        let payload = json!({"deviceId": "SNS-1001", "severity": "critical"});
        let stored = codec.compress(&payload).unwrap();
        assert_eq!(stored, StoredPayload::Plain(payload.clone()));
        assert_eq!(codec.decompress(&stored).unwrap(), payload);
    }

    #[test]
    fn large_payload_is_compressed_for_every_algorithm() {
        let payload = large_payload();
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Deflate,
        ] {
            let codec = Codec::new(CodecConfig {
                algorithm,
                ..CodecConfig::default()
            });
            let stored = codec.compress(&payload).unwrap();
            assert!(stored.is_compressed(), "{algorithm:?} should compress");
            assert_eq!(codec.decompress(&stored).unwrap(), payload);
        }
    }

    #[test]
    fn threshold_is_exclusive() {
        let payload = json!({"k": "v"});
        let size = serde_json::to_vec(&payload).unwrap().len();
        let at_threshold = Codec::new(CodecConfig {
            threshold_bytes: size,
            ..CodecConfig::default()
        });
        assert!(!at_threshold.compress(&payload).unwrap().is_compressed());
        let below = Codec::new(CodecConfig {
            threshold_bytes: size - 1,
            ..CodecConfig::default()
        });
        assert!(below.compress(&payload).unwrap().is_compressed());
    }

    #[test]
    fn compression_is_deterministic() {
        let codec = Codec::default();
        let payload = large_payload();
        assert_eq!(codec.compress(&payload).unwrap(), codec.compress(&payload).unwrap());
    }

    #[test]
    fn corrupt_bytes_fail_with_codec_error() {
        let codec = Codec::default();
        let stored = StoredPayload::Compressed {
            algorithm: CompressionAlgorithm::Gzip,
            bytes: b"definitely not gzip".to_vec(),
        };
        assert!(matches!(codec.decompress(&stored), Err(PipelineError::Codec(_))));
    }

    #[test]
    fn stored_payload_survives_json_storage() {
        let codec = Codec::default();
        let stored = codec.compress(&large_payload()).unwrap();
        let encoded = serde_json::to_string(&stored).unwrap();
        let wire: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(wire["compressed"], true);
        assert_eq!(wire["algorithm"], "gzip");
        assert!(wire["data"].is_string());
        let decoded: StoredPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, stored);
    }

    #[test]
    fn compressed_wire_payload_must_be_base64() {
        let raw = json!({"compressed": true, "data": {"not": "bytes"}});
        assert!(serde_json::from_value::<StoredPayload>(raw).is_err());
    }
}
