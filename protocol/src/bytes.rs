//! Serde representation for raw PDU payloads.
//!
//! Opaque byte blobs (custom function bodies, event logs, identification
//! objects) serialize as base64 text. Use with `#[serde(with = "bytes")]`.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&base64::encode(data))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    base64::decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Blob {
        #[serde(with = "super")]
        data: Vec<u8>,
    }

    #[test]
    fn test_bytes_as_base64() {
        let blob = Blob {
            data: vec![0x44, 0x00, 0xFF],
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"RAD/"}"#);
        let back: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(serde_json::from_str::<Blob>(r#"{"data":"not base64!"}"#).is_err());
    }
}
