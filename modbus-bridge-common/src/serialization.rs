use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for persisted register state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, good for debugging).
    #[default]
    Json,

    /// CBOR format (compact binary, better for full register banks).
    Cbor,
}

impl Format {
    /// File extension used when persisting data in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Cbor => "cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        holding: Vec<u16>,
        coils: Vec<bool>,
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            holding: vec![0, 1, 0xFFFF, 42],
            coils: vec![true, false, true],
        }
    }

    #[test]
    fn test_json_snapshot() {
        let encoded = encode(&snapshot(), Format::Json).unwrap();
        assert_eq!(encoded.first(), Some(&b'{'));

        let decoded: Snapshot = decode(&encoded, Format::Json).unwrap();
        assert_eq!(decoded, snapshot());
    }

    #[test]
    fn test_cbor_is_smaller() {
        let json = encode(&snapshot(), Format::Json).unwrap();
        let cbor = encode(&snapshot(), Format::Cbor).unwrap();

        assert!(cbor.len() < json.len(), "CBOR should be smaller than JSON");
    }

    #[test]
    fn test_extension() {
        assert_eq!(Format::Json.extension(), "json");
        assert_eq!(Format::Cbor.extension(), "cbor");
    }
}
