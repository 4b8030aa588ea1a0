//! Serde adapter that writes byte buffers as base64 strings instead of JSON
//! number arrays. Use with `#[serde(with = "bytes")]`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super")]
        data: Vec<u8>,
    }

    #[test]
    fn bytes_are_base64_strings() {
        let blob = Blob { data: b"raft".to_vec() };

        let json = serde_json::to_string(&blob).unwrap();

        assert_eq!(json, r#"{"data":"cmFmdA=="}"#);
        assert_eq!(serde_json::from_str::<Blob>(&json).unwrap(), blob);
    }

    #[test]
    fn encoding_stays_near_raw_size() {
        let blob = Blob { data: vec![0xab; 30_000] };

        let json = serde_json::to_vec(&blob).unwrap();

        assert!(json.len() < 30_000 * 4 / 3 + 64, "{} bytes", json.len());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(serde_json::from_str::<Blob>(r#"{"data":"not base64!"}"#).is_err());
    }
}
