//! CBOR encoding for wire messages.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// The bytes are not a valid message.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encodes a value as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// A message with a CBOR wire form.
pub trait WireMessage: Sized {
    /// Encodes to CBOR.
    fn encode(&self) -> ProtocolResult<Vec<u8>>;

    /// Decodes from CBOR.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self>;
}

macro_rules! wire_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::codec::WireMessage for $ty {
                fn encode(&self) -> $crate::codec::ProtocolResult<Vec<u8>> {
                    $crate::codec::to_cbor(self)
                }

                fn decode(bytes: &[u8]) -> $crate::codec::ProtocolResult<Self> {
                    $crate::codec::from_cbor(bytes)
                }
            }
        )*
    };
}

pub(crate) use wire_message;
