// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encode or decode values in [CBOR] format.
//!
//! Key material and session state is serialized as CBOR before it gets sealed and handed to the
//! persistence service. The same encoding gives us a canonical byte representation of message
//! headers which are bound as associated data during encryption.
//!
//! [CBOR]: https://cbor.io/
use std::io::Read;

use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializes a value into CBOR format.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(Into::<EncodeError>::into)?;
    Ok(bytes)
}

/// Deserializes a value which was formatted in CBOR.
pub fn decode_cbor<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T, DecodeError> {
    let value = ciborium::from_reader::<T, R>(reader).map_err(Into::<DecodeError>::into)?;
    Ok(value)
}

/// An error occurred during CBOR serialization.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

/// An error occurred during CBOR deserialization.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    /// Contains the offset into the stream where the syntax error occurred.
    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::{ConversationId, UserId};

    use super::{DecodeError, decode_cbor, encode_cbor};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Header {
        conversation: ConversationId,
        sender: UserId,
        counter: u32,
    }

    #[test]
    fn encode_decode() {
        let header = Header {
            conversation: ConversationId::new("group-1").unwrap(),
            sender: UserId::new("alice").unwrap(),
            counter: 7,
        };

        let bytes = encode_cbor(&header).unwrap();
        let header_again: Header = decode_cbor(&bytes[..]).unwrap();
        assert_eq!(header, header_again);
    }

    #[test]
    fn truncated_input() {
        let bytes = encode_cbor(&UserId::new("alice").unwrap()).unwrap();
        let result: Result<UserId, DecodeError> = decode_cbor(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
