// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encryption of message edits.
//!
//! Edited content is encrypted with a fresh single-use key, which is wrapped for every recipient
//! with their identity key and sent alongside. Edits do not touch any ratchet or sender chain, a
//! recipient can decrypt them regardless of how far the conversation moved on.
//!
//! This comes at a price: edits are only protected by the long-term identity keys of the
//! recipients and do not offer forward secrecy. A leaked identity secret reveals all edits ever
//! addressed to it.
use murmur_core::{
    ConversationId, DecodeError, EncodeError, MessageId, UserId, decode_cbor, encode_cbor,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::Signature;
use crate::crypto::hpke::HpkeCiphertext;
use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError, SymmetricKey};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};

const WRAP_INFO: &[u8] = b"murmur-edit-key";

/// Edit key wrapped for one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedEditKey {
    pub recipient: UserId,
    pub wrapped: HpkeCiphertext,
}

/// Replacement content for an earlier message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessage {
    pub sender: UserId,

    /// Message the edit replaces.
    pub target: MessageId,
    pub ciphertext: AeadCiphertext,
    pub keys: Vec<WrappedEditKey>,

    /// Signature of the sender over all of the above.
    pub signature: Signature,
}

impl EditMessage {
    fn signed_bytes(&self, conversation: &ConversationId) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            conversation,
            &self.sender,
            &self.target,
            &self.ciphertext,
            &self.keys,
        ))
    }
}

pub struct Edit;

impl Edit {
    pub fn encrypt<E: CryptoEngine>(
        conversation: &ConversationId,
        sender: &UserId,
        our_identity: &IdentityKeyPair,
        target: &MessageId,
        plaintext: &[u8],
        recipients: &[(UserId, IdentityKey)],
        engine: &E,
    ) -> Result<EditMessage, EditError> {
        let edit_key = engine.new_symmetric_key()?;
        let ciphertext = engine.aead_seal(
            &edit_key,
            plaintext,
            &encode_cbor(&(conversation, sender, target))?,
        )?;

        let encoded_key = encode_cbor(&edit_key)?;
        let mut keys = Vec::with_capacity(recipients.len());
        for (recipient, identity) in recipients {
            let aad = encode_cbor(&(conversation, sender, target, recipient))?;
            let wrapped = engine.kem_encapsulate(identity.kem(), WRAP_INFO, &aad, &encoded_key)?;
            keys.push(WrappedEditKey {
                recipient: recipient.clone(),
                wrapped,
            });
        }

        let mut message = EditMessage {
            sender: sender.clone(),
            target: target.clone(),
            ciphertext,
            keys,
            signature: Signature::from_bytes([0; 64]),
        };
        message.signature = engine.sign(
            our_identity.signing_key(),
            &message.signed_bytes(conversation)?,
        )?;

        Ok(message)
    }

    pub fn decrypt<E: CryptoEngine>(
        conversation: &ConversationId,
        message: &EditMessage,
        sender_identity: &IdentityKey,
        our_id: &UserId,
        our_identity: &IdentityKeyPair,
        engine: &E,
    ) -> Result<Vec<u8>, EditError> {
        engine.verify(
            sender_identity.signing(),
            &message.signed_bytes(conversation)?,
            &message.signature,
        )?;

        let wrapped_key = message
            .keys
            .iter()
            .find(|key| &key.recipient == our_id)
            .ok_or(EditError::NotARecipient)?;

        let aad = encode_cbor(&(conversation, &message.sender, &message.target, our_id))?;
        let encoded_key = engine.kem_decapsulate(
            our_identity.kem_secret(),
            WRAP_INFO,
            &aad,
            &wrapped_key.wrapped,
        )?;
        let edit_key: SymmetricKey = decode_cbor(&encoded_key[..])?;

        Ok(engine.aead_open(
            &edit_key,
            &message.ciphertext,
            &encode_cbor(&(conversation, &message.sender, &message.target))?,
        )?)
    }
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("edit does not carry a key for us")]
    NotARecipient,
}

impl EditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EditError::Crypto(err) => err.kind(),
            EditError::NotARecipient => ErrorKind::MissingKey,
            EditError::Encode(_) | EditError::Decode(_) => ErrorKind::Internal,
        }
    }
}
