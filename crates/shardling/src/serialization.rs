//! MessagePack codec shared by every pod.
//!
//! Message bodies and replies cross the wire as MessagePack bytes. Both ends
//! of a deployment use this module, so compatibility holds by construction.

use crate::error::ShardingError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value to MessagePack bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ShardingError> {
    rmp_serde::to_vec(value).map_err(|e| ShardingError::Serde {
        reason: format!("failed to encode value: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Decode a value from MessagePack bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShardingError> {
    rmp_serde::from_slice(bytes).map_err(|e| ShardingError::Serde {
        reason: format!("failed to decode value: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Encode one element of a streamed reply or send.
///
/// Stream elements are framed by the transport; each chunk is a standalone
/// MessagePack document.
pub fn encode_chunk<T: Serialize>(value: &T) -> Result<Vec<u8>, ShardingError> {
    encode(value)
}

/// Decode one element of a streamed reply or send.
pub fn decode_chunk<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShardingError> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        id: String,
        count: u64,
    }

    #[test]
    fn encode_decode_round_trip() {
        let value = Payload {
            id: "user-42".into(),
            count: 7,
        };
        let bytes = encode(&value).unwrap();
        let decoded: Payload = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_garbage_fails() {
        let err = decode::<Payload>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ShardingError::Serde { .. }));
    }
}
