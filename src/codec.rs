//! Payload codec: JSON to bytes and back

use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Stateless JSON payload codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a payload to bytes
    pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(payload)?))
    }

    /// Decode bytes into a payload
    ///
    /// An empty body decodes as JSON `null`, so handlers typed as
    /// `serde_json::Value` or `Option<T>` accept it.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
