//! Wire format for everything that crosses a shard boundary.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serialize a global state snapshot or partial result.
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Push a value through the wire format and back.
pub fn round_trip<T: Serialize + DeserializeOwned>(value: &T) -> Result<T> {
    unpack(&pack(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiapError;

    #[test]
    fn truncated_payload_fails_to_decode() {
        let bytes = pack(&vec![1.0f64, 2.0, 3.0]).expect("pack");
        let err = unpack::<Vec<f64>>(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DiapError::Codec(_)));
    }
}
