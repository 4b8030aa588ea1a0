use serde::de::DeserializeOwned;
use serde::Serialize;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datagram of {0} bytes exceeds {MAX_DATAGRAM}")]
    Oversized(usize),
}

/// Encode `value` as one JSON datagram.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(CodecError::Oversized(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}
