//! Value encoding for the disk tier

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encodes values to bytes and back
pub trait Serializer: Send + Sync + 'static {
    fn serialize<V: Serialize>(&self, value: &V) -> Result<Bytes>;

    fn deserialize<V: DeserializeOwned>(&self, data: &[u8]) -> Result<V>;

    /// File extension of encoded values, without the dot
    fn extension(&self) -> &'static str;
}

/// JSON encoding via serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<V: Serialize>(&self, value: &V) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<V: DeserializeOwned>(&self, data: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(data)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
        price: f64,
    }

    #[test]
    fn test_json_encodes_struct() {
        let quote = Quote {
            symbol: "AAPL".into(),
            price: 187.5,
        };
        let bytes = JsonSerializer.serialize(&quote).unwrap();
        assert_eq!(&bytes[..], br#"{"symbol":"AAPL","price":187.5}"#);

        let back: Quote = JsonSerializer.deserialize(&bytes).unwrap();
        assert_eq!(back, quote);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = JsonSerializer.deserialize::<Quote>(b"{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Serialization);
    }
}
