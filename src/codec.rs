//! Data-codec seam between application values and wire payload bytes.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Encodes and decodes the data element of event payloads.
///
/// The packet framing itself is always JSON-shaped; this seam only covers
/// the application data carried inside it, so alternative serializers can
/// be plugged in as long as they produce valid JSON bytes. Handlers that
/// receive raw payload bytes can use the engine's codec to decode them.
pub trait DataCodec: Send + Sync {
    fn marshal(&self, value: &JsonValue) -> Result<Vec<u8>>;
    fn unmarshal(&self, data: &[u8]) -> Result<JsonValue>;
}

/// Default codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl DataCodec for JsonCodec {
    fn marshal(&self, value: &JsonValue) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<JsonValue> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// JSON-encode a value, swallowing failures into an empty payload.
///
/// Used for server-built payloads (acks, handshake replies, error bodies)
/// whose shapes cannot fail to serialize.
pub(crate) fn to_json_bytes<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::error!("failed to encode server payload: {err}");
            Bytes::new()
        }
    }
}
