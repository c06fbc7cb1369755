//! JSON and JSONB codecs.
//!
//! JSON travels as UTF-8 text. JSONB's binary format is the same text behind a
//! one-byte version prefix (`0x01`). Decoding goes through a deserializer the
//! caller can replace, `serde_json::from_str` by default.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Version byte that prefixes the JSONB binary format.
pub const JSONB_VERSION: u8 = 0x01;

type Deserializer = dyn Fn(&str) -> serde_json::Result<serde_json::Value> + Send + Sync;

/// JSON/JSONB encoder and decoder.
#[derive(Clone)]
pub struct JsonCodec {
    deserializer: Arc<Deserializer>,
}

impl fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").finish_non_exhaustive()
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::with_deserializer(|text| serde_json::from_str(text))
    }
}

impl JsonCodec {
    /// Codec using a custom deserializer.
    pub fn with_deserializer<F>(deserializer: F) -> Self
    where
        F: Fn(&str) -> serde_json::Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            deserializer: Arc::new(deserializer),
        }
    }

    /// Encode JSON text for a `json` parameter.
    #[must_use]
    pub fn encode_json(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    /// Encode JSON text for a `jsonb` parameter.
    #[must_use]
    pub fn encode_jsonb(text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 1);
        out.push(JSONB_VERSION);
        out.extend_from_slice(text.as_bytes());
        out
    }

    /// Decode a `json` column.
    pub fn decode_json(&self, raw: &[u8]) -> Result<serde_json::Value> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::data(format!("json payload is not valid UTF-8: {e}")))?;
        self.deserialize(text)
    }

    /// Decode a `jsonb` column.
    ///
    /// The first byte is stripped without checking it against
    /// [`JSONB_VERSION`].
    pub fn decode_jsonb(&self, raw: &[u8]) -> Result<serde_json::Value> {
        let Some((_, body)) = raw.split_first() else {
            return Err(Error::data("empty jsonb payload"));
        };
        self.decode_json(body)
    }

    fn deserialize(&self, text: &str) -> Result<serde_json::Value> {
        (self.deserializer)(text).map_err(|e| Error::data(format!("invalid json: {e}")))
    }
}
