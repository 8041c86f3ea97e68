// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keys protecting conversation metadata.
//!
//! Every conversation gets one symmetric key at creation, wrapped for each member with their
//! identity key. It only encrypts metadata like the conversation name or icon, message bodies are
//! encrypted by the ratchet, the sender chains or the channel key.
use murmur_core::{ConversationId, DecodeError, EncodeError, UserId, decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::Signature;
use crate::crypto::hpke::HpkeCiphertext;
use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError, SymmetricKey};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};

const WRAP_INFO: &[u8] = b"murmur-conversation-key";

const METADATA_AAD: &[u8] = b"murmur-metadata";

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct ConversationKey(SymmetricKey);

/// Conversation metadata readable by members only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub name: Option<String>,

    #[serde(with = "serde_bytes")]
    pub icon: Option<Vec<u8>>,
}

/// Conversation key wrapped for one member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedConversationKey {
    pub conversation: ConversationId,
    pub member: UserId,
    pub wrapped_by: UserId,
    pub wrapped: HpkeCiphertext,
    pub signature: Signature,
}

impl WrappedConversationKey {
    fn signed_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            &self.conversation,
            &self.member,
            &self.wrapped_by,
            &self.wrapped,
        ))
    }
}

impl ConversationKey {
    pub fn generate<E: CryptoEngine>(engine: &E) -> Result<Self, ConversationKeyError> {
        Ok(Self(engine.new_symmetric_key()?))
    }

    pub fn wrap<E: CryptoEngine>(
        &self,
        conversation: &ConversationId,
        our_id: &UserId,
        our_identity: &IdentityKeyPair,
        member: &UserId,
        member_identity: &IdentityKey,
        engine: &E,
    ) -> Result<WrappedConversationKey, ConversationKeyError> {
        let aad = encode_cbor(&(conversation, member))?;
        let wrapped = engine.kem_encapsulate(
            member_identity.kem(),
            WRAP_INFO,
            &aad,
            &encode_cbor(&self.0)?,
        )?;

        let mut wrapped_key = WrappedConversationKey {
            conversation: conversation.clone(),
            member: member.clone(),
            wrapped_by: our_id.clone(),
            wrapped,
            signature: Signature::from_bytes([0; 64]),
        };
        wrapped_key.signature =
            engine.sign(our_identity.signing_key(), &wrapped_key.signed_bytes()?)?;

        Ok(wrapped_key)
    }

    pub fn unwrap<E: CryptoEngine>(
        wrapped_key: &WrappedConversationKey,
        wrapper_identity: &IdentityKey,
        our_identity: &IdentityKeyPair,
        engine: &E,
    ) -> Result<Self, ConversationKeyError> {
        engine.verify(
            wrapper_identity.signing(),
            &wrapped_key.signed_bytes()?,
            &wrapped_key.signature,
        )?;

        let aad = encode_cbor(&(&wrapped_key.conversation, &wrapped_key.member))?;
        let plaintext = engine.kem_decapsulate(
            our_identity.kem_secret(),
            WRAP_INFO,
            &aad,
            &wrapped_key.wrapped,
        )?;

        Ok(Self(decode_cbor(&plaintext[..])?))
    }

    pub fn encrypt_metadata<E: CryptoEngine>(
        &self,
        conversation: &ConversationId,
        metadata: &ConversationMetadata,
        engine: &E,
    ) -> Result<AeadCiphertext, ConversationKeyError> {
        let aad = encode_cbor(&(METADATA_AAD, conversation))?;
        Ok(engine.aead_seal(&self.0, &encode_cbor(metadata)?, &aad)?)
    }

    pub fn decrypt_metadata<E: CryptoEngine>(
        &self,
        conversation: &ConversationId,
        ciphertext: &AeadCiphertext,
        engine: &E,
    ) -> Result<ConversationMetadata, ConversationKeyError> {
        let aad = encode_cbor(&(METADATA_AAD, conversation))?;
        let plaintext = engine.aead_open(&self.0, ciphertext, &aad)?;
        Ok(decode_cbor(&plaintext[..])?)
    }
}

#[derive(Debug, Error)]
pub enum ConversationKeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ConversationKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversationKeyError::Crypto(err) => err.kind(),
            ConversationKeyError::Encode(_) | ConversationKeyError::Decode(_) => {
                ErrorKind::Internal
            }
        }
    }
}
