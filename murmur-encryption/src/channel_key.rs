// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared symmetric keys for server channels.
//!
//! A channel has a single key, identified by its SHA-256 digest. The first member who needs it
//! generates the key. Every holder can wrap it for a joining member, the wrapped copy is stored as
//! a membership record on the persistence service and pushed to the member through the realtime
//! transport. Members who missed the push load their record later.
//!
//! Two members creating a key at the same time leads to two keys in the ring. Everybody encrypts
//! with the key with the smallest id, so the channel converges once all keys were exchanged.
//!
//! Keys are never rotated when a member leaves.
use std::collections::BTreeMap;
use std::fmt;

use murmur_core::{ConversationId, DecodeError, EncodeError, UserId, decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::Signature;
use crate::crypto::hpke::HpkeCiphertext;
use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError, SymmetricKey};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};

const WRAP_INFO: &[u8] = b"murmur-channel-key";

/// SHA-256 digest of a channel key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKeyId(#[serde(with = "serde_bytes")] [u8; 32]);

impl ChannelKeyId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChannelKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChannelKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelKeyId").field(&self.to_hex()).finish()
    }
}

/// Channel key wrapped for one member.
///
/// Stored on the persistence service and pushed to the member when it joins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub channel: ConversationId,
    pub member: UserId,
    pub key_id: ChannelKeyId,

    /// Member who wrapped the key, its identity signed the record.
    pub wrapped_by: UserId,
    pub wrapped: HpkeCiphertext,
    pub signature: Signature,
}

impl MembershipRecord {
    fn signed_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(&(
            &self.channel,
            &self.member,
            &self.key_id,
            &self.wrapped_by,
            &self.wrapped,
        ))
    }
}

/// Message encrypted with a channel key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: UserId,
    pub key_id: ChannelKeyId,
    pub ciphertext: AeadCiphertext,
}

/// Channel keys we hold for one channel.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct ChannelKeyRing {
    channel: ConversationId,
    keys: BTreeMap<ChannelKeyId, SymmetricKey>,
}

impl ChannelKeyRing {
    pub fn channel(&self) -> &ConversationId {
        &self.channel
    }

    /// Key used for encryption, `None` while we do not hold any key for the channel.
    pub fn current(&self) -> Option<ChannelKeyId> {
        self.keys.keys().next().copied()
    }

    pub fn contains(&self, key_id: &ChannelKeyId) -> bool {
        self.keys.contains_key(key_id)
    }
}

/// Channel key fan-out protocol.
pub struct ChannelKeys;

impl ChannelKeys {
    pub fn init(channel: ConversationId) -> ChannelKeyRing {
        ChannelKeyRing {
            channel,
            keys: BTreeMap::new(),
        }
    }

    /// Generates a new channel key and adds it to the ring.
    pub fn create<E: CryptoEngine>(
        mut y: ChannelKeyRing,
        engine: &E,
    ) -> Result<(ChannelKeyRing, ChannelKeyId), ChannelKeyError> {
        let key = engine.new_symmetric_key()?;
        let key_id = ChannelKeyId(engine.hash(&[key.as_bytes().as_slice()]));
        y.keys.insert(key_id, key);
        Ok((y, key_id))
    }

    /// Wraps the current channel key for a member.
    pub fn wrap<E: CryptoEngine>(
        y: &ChannelKeyRing,
        our_id: &UserId,
        our_identity: &IdentityKeyPair,
        member: &UserId,
        member_identity: &IdentityKey,
        engine: &E,
    ) -> Result<MembershipRecord, ChannelKeyError> {
        let key_id = y.current().ok_or(ChannelKeyError::NoChannelKey)?;
        let key = y.keys.get(&key_id).ok_or(ChannelKeyError::NoChannelKey)?;

        let aad = encode_cbor(&(&y.channel, member, &key_id))?;
        let wrapped = engine.kem_encapsulate(
            member_identity.kem(),
            WRAP_INFO,
            &aad,
            &encode_cbor(key)?,
        )?;

        let mut record = MembershipRecord {
            channel: y.channel.clone(),
            member: member.clone(),
            key_id,
            wrapped_by: our_id.clone(),
            wrapped,
            signature: Signature::from_bytes([0; 64]),
        };
        record.signature = engine.sign(our_identity.signing_key(), &record.signed_bytes()?)?;

        Ok(record)
    }

    /// Unwraps a membership record addressed to us and adds its key to the ring.
    ///
    /// Applying the same record twice leaves the ring unchanged.
    pub fn unwrap<E: CryptoEngine>(
        mut y: ChannelKeyRing,
        record: &MembershipRecord,
        wrapper_identity: &IdentityKey,
        our_identity: &IdentityKeyPair,
        engine: &E,
    ) -> Result<ChannelKeyRing, ChannelKeyError> {
        if record.channel != y.channel {
            return Err(ChannelKeyError::ChannelMismatch(record.channel.clone()));
        }

        engine.verify(
            wrapper_identity.signing(),
            &record.signed_bytes()?,
            &record.signature,
        )?;

        if y.keys.contains_key(&record.key_id) {
            return Ok(y);
        }

        let aad = encode_cbor(&(&record.channel, &record.member, &record.key_id))?;
        let plaintext =
            engine.kem_decapsulate(our_identity.kem_secret(), WRAP_INFO, &aad, &record.wrapped)?;
        let key: SymmetricKey = decode_cbor(&plaintext[..])?;

        if engine.hash(&[key.as_bytes().as_slice()]) != record.key_id.0 {
            return Err(ChannelKeyError::KeyIdMismatch(record.key_id));
        }

        y.keys.insert(record.key_id, key);
        Ok(y)
    }

    pub fn encrypt<E: CryptoEngine>(
        y: &ChannelKeyRing,
        sender: &UserId,
        plaintext: &[u8],
        engine: &E,
    ) -> Result<ChannelMessage, ChannelKeyError> {
        let key_id = y.current().ok_or(ChannelKeyError::NoChannelKey)?;
        let key = y.keys.get(&key_id).ok_or(ChannelKeyError::NoChannelKey)?;

        let aad = encode_cbor(&(&y.channel, sender, &key_id))?;
        let ciphertext = engine.aead_seal(key, plaintext, &aad)?;

        Ok(ChannelMessage {
            sender: sender.clone(),
            key_id,
            ciphertext,
        })
    }

    pub fn decrypt<E: CryptoEngine>(
        y: &ChannelKeyRing,
        message: &ChannelMessage,
        engine: &E,
    ) -> Result<Vec<u8>, ChannelKeyError> {
        let key = y
            .keys
            .get(&message.key_id)
            .ok_or(ChannelKeyError::NoChannelKey)?;

        let aad = encode_cbor(&(&y.channel, &message.sender, &message.key_id))?;
        Ok(engine.aead_open(key, &message.ciphertext, &aad)?)
    }
}

#[derive(Debug, Error)]
pub enum ChannelKeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no channel key available")]
    NoChannelKey,

    #[error("membership record belongs to channel {0}")]
    ChannelMismatch(ConversationId),

    #[error("unwrapped channel key does not match id {0}")]
    KeyIdMismatch(ChannelKeyId),
}

impl ChannelKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelKeyError::Crypto(err) => err.kind(),
            ChannelKeyError::NoChannelKey => ErrorKind::MissingKey,
            ChannelKeyError::ChannelMismatch(_) | ChannelKeyError::KeyIdMismatch(_) => {
                ErrorKind::Verification
            }
            ChannelKeyError::Encode(_) | ChannelKeyError::Decode(_) => ErrorKind::Internal,
        }
    }
}
