//! Codec: how envelopes become bytes and come back.
//!
//! The engine never serializes inline — everything goes through a [`Codec`]
//! so the wire format is swappable. [`JsonCodec`] is the default (and what
//! the web client speaks); a binary codec can slot in later without
//! touching any other layer.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are malformed or do
    /// not match the expected shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// JSON codec via `serde_json`. Human-readable, inspectable in browser
/// dev tools, and the format the campaign web app already speaks.
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{ClientEnvelope, PROTOCOL_VERSION};

    #[test]
    fn test_json_codec_round_trips_envelopes() {
        let codec = JsonCodec;
        let msg = ClientEnvelope::Hello {
            version: PROTOCOL_VERSION,
            token: "tok".into(),
        };
        let bytes = codec.encode(&msg).unwrap();
        let decoded: ClientEnvelope = codec.decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_codec_decode_wrong_shape_errors() {
        let codec = JsonCodec;
        let result: Result<ClientEnvelope, _> = codec.decode(br#"{"name":"hello"}"#);
        assert!(result.is_err());
    }
}
