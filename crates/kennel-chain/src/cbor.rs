//! CBOR encoding of chain messages.
//!
//! Messages travel to the gateway as CBOR, and the queue sizes batches by
//! the length of this encoding.

use serde::Serialize;

use crate::{ChainError, Result};

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ChainError::Encoding(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
#[cfg(test)]
pub(crate) fn from_slice<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data)
        .map_err(|e| ChainError::Encoding(format!("CBOR deserialization failed: {e}")))
}
