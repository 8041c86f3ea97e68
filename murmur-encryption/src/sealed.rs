// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sealing local state before it is handed to the untrusted persistence service.
//!
//! Every blob is encoded as CBOR and encrypted under the device key. The storage slot the blob is
//! written to is bound as associated data, a blob moved into another slot fails to open.
use murmur_core::{ConversationId, DecodeError, EncodeError, UserId, decode_cbor, encode_cbor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError, Secret, SymmetricKey};
use crate::error::ErrorKind;

/// Local symmetric key sealing everything we store on the persistence service.
///
/// The key itself never leaves the device, applications keep it in the platform's secure storage.
/// Losing it means losing all sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceKey(SymmetricKey);

impl DeviceKey {
    pub fn generate<E: CryptoEngine>(engine: &E) -> Result<Self, CryptoError> {
        Ok(Self(engine.new_symmetric_key()?))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }
}

/// Storage slots on the persistence service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobKey {
    /// Identity, signed prekeys and one-time prekey secrets.
    KeyManager,

    /// Ratchet state of a direct session.
    Session {
        conversation: ConversationId,
        peer: UserId,
    },

    /// Our own sender chain and the chains we received from other group members.
    SenderKeys(ConversationId),

    /// Channel keys we hold for a server channel.
    ChannelKeys(ConversationId),

    /// Key protecting the metadata of a conversation.
    ConversationKey(ConversationId),

    /// Keys received for a conversation we did not join yet.
    PendingKeys(ConversationId),

    /// Registry of all conversations and their members.
    Conversations,
}

/// Encrypted blob as stored on the persistence service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob(AeadCiphertext);

impl SealedBlob {
    pub fn seal<T: Serialize, E: CryptoEngine>(
        device_key: &DeviceKey,
        key: &BlobKey,
        value: &T,
        engine: &E,
    ) -> Result<Self, SealError> {
        let aad = encode_cbor(key)?;
        let plaintext = encode_cbor(value)?;
        Ok(Self(engine.aead_seal(&device_key.0, &plaintext, &aad)?))
    }

    pub fn open<T: DeserializeOwned, E: CryptoEngine>(
        &self,
        device_key: &DeviceKey,
        key: &BlobKey,
        engine: &E,
    ) -> Result<T, SealError> {
        let aad = encode_cbor(key)?;
        let plaintext = engine.aead_open(&device_key.0, &self.0, &aad)?;
        Ok(decode_cbor(&plaintext[..])?)
    }
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl SealError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SealError::Crypto(err) => err.kind(),
            SealError::Encode(_) | SealError::Decode(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use murmur_core::{ConversationId, UserId};

    use crate::crypto::Crypto;
    use crate::error::ErrorKind;

    use super::{BlobKey, DeviceKey, SealError, SealedBlob};

    #[test]
    fn seal_and_open() {
        let engine = Crypto::from_seed([1; 32]);
        let device_key = DeviceKey::generate(&engine).unwrap();

        let key = BlobKey::Session {
            conversation: ConversationId::new("dm").unwrap(),
            peer: UserId::new("bob").unwrap(),
        };

        let blob = SealedBlob::seal(&device_key, &key, &vec![1u32, 2, 3], &engine).unwrap();
        let value: Vec<u32> = blob.open(&device_key, &key, &engine).unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        // Restored device key opens the blob as well.
        let restored = DeviceKey::from_bytes(device_key.to_bytes());
        let value: Vec<u32> = blob.open(&restored, &key, &engine).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn wrong_device_key() {
        let engine = Crypto::from_seed([1; 32]);
        let device_key = DeviceKey::generate(&engine).unwrap();
        let other_device_key = DeviceKey::generate(&engine).unwrap();

        let blob = SealedBlob::seal(&device_key, &BlobKey::KeyManager, &"secret", &engine).unwrap();
        let result: Result<String, SealError> =
            blob.open(&other_device_key, &BlobKey::KeyManager, &engine);
        assert_matches!(result, Err(SealError::Crypto(_)));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Verification);
    }

    #[test]
    fn swapped_slots() {
        let engine = Crypto::from_seed([1; 32]);
        let device_key = DeviceKey::generate(&engine).unwrap();

        let group_1 = BlobKey::SenderKeys(ConversationId::new("group-1").unwrap());
        let group_2 = BlobKey::SenderKeys(ConversationId::new("group-2").unwrap());

        let blob = SealedBlob::seal(&device_key, &group_1, &42u8, &engine).unwrap();
        let result: Result<u8, SealError> = blob.open(&device_key, &group_2, &engine);
        assert_matches!(result, Err(SealError::Crypto(_)));
    }
}
