//! Value envelope codec
//!
//! Every cached value is wrapped with its write timestamp and a type tag
//! before storage, so decompression and type recovery are self-describing;
//! the envelope is what replicates between regions, never the raw value.
//! Envelopes above the compression threshold are gzip-compressed; decoding
//! detects compression by the gzip magic bytes before JSON parsing.

use crate::{CacheError, CacheResult};
use bytes::Bytes;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Recorded shape of the wrapped value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// JSON null
    Null,
    /// JSON boolean
    Bool,
    /// JSON number
    Number,
    /// JSON string
    String,
    /// JSON array
    Array,
    /// JSON object
    Object,
}

impl ValueKind {
    /// Classify a JSON value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }
}

/// The stored wrapper around a caller value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Original value
    pub v: Value,
    /// Write time, epoch milliseconds; last-write-wins discriminator
    pub at: i64,
    /// Recorded value shape
    pub kind: ValueKind,
}

impl Envelope {
    /// Wrap a value, stamping the current time
    pub fn wrap(value: Value) -> Self {
        let kind = ValueKind::of(&value);
        Self {
            v: value,
            at: Utc::now().timestamp_millis(),
            kind,
        }
    }
}

/// Encode an envelope, compressing above the threshold
pub fn encode(envelope: &Envelope, compression_threshold: usize) -> CacheResult<Bytes> {
    let json = serde_json::to_vec(envelope).map_err(|e| CacheError::Encode(e.to_string()))?;

    if json.len() <= compression_threshold {
        return Ok(Bytes::from(json));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CacheError::Encode(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CacheError::Encode(e.to_string()))?;
    Ok(Bytes::from(compressed))
}

/// Decode stored bytes, auto-detecting compression
pub fn decode(bytes: &[u8]) -> CacheResult<Envelope> {
    let json: Vec<u8>;
    let slice = if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        json = out;
        json.as_slice()
    } else {
        bytes
    };

    serde_json::from_slice(slice).map_err(|e| CacheError::Decode(e.to_string()))
}
