// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender keys for group conversations.
//!
//! Every member owns one symmetric sender chain per group and hands a copy of its current state
//! to every other member, wrapped for their identity key and signed with the owner's identity.
//! Messages are encrypted once with the next key of the sender's chain, regardless of group size.
//!
//! A receiver can derive all keys from the iteration it received onwards, but never the ones
//! before. Members joining later thus can not read history, while the owner's chain moves on only
//! in one direction.
//!
//! Removing a member does not replace any chain. A removed member who kept the chain keys can
//! still derive future message keys of the chains it received.
use std::collections::{BTreeMap, VecDeque};

use murmur_core::{ConversationId, DecodeError, EncodeError, UserId, decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainKey, MessageKey};
use crate::config::SkipLimits;
use crate::crypto::ed25519::Signature;
use crate::crypto::hpke::HpkeCiphertext;
use crate::crypto::{AeadCiphertext, CryptoEngine, CryptoError};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};

const DISTRIBUTION_INFO: &[u8] = b"murmur-sender-key";

/// Random identifier of a sender chain.
pub type ChainId = u32;

/// Sender keys protocol for group conversations.
pub struct SenderKey;

/// Chain we own and advance when sending.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
struct SenderChain {
    chain_id: ChainId,
    iteration: u32,
    chain_key: ChainKey,
}

/// Copy of another member's chain.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
struct ReceivedChain {
    chain_id: ChainId,

    /// Next iteration we can derive a key for.
    iteration: u32,
    chain_key: ChainKey,
    skipped: VecDeque<(u32, MessageKey)>,
}

/// Sender chains of one group, our own and the ones we received.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct SenderKeyState {
    conversation: ConversationId,
    own: Option<SenderChain>,
    received: BTreeMap<UserId, ReceivedChain>,
}

impl SenderKeyState {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Chain id and next iteration of our own chain.
    pub fn own_chain(&self) -> Option<(ChainId, u32)> {
        self.own
            .as_ref()
            .map(|chain| (chain.chain_id, chain.iteration))
    }

    /// Chain id and next iteration we hold for a sender.
    pub fn received_chain(&self, sender: &UserId) -> Option<(ChainId, u32)> {
        self.received
            .get(sender)
            .map(|chain| (chain.chain_id, chain.iteration))
    }
}

/// Group message encrypted with a sender chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub sender: UserId,
    pub chain_id: ChainId,
    pub iteration: u32,
    pub ciphertext: AeadCiphertext,
}

/// Sender chain wrapped for a single recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub conversation: ConversationId,
    pub sender: UserId,
    pub recipient: UserId,
    pub ciphertext: HpkeCiphertext,
}

#[derive(Serialize, Deserialize)]
struct DistributionPayload {
    chain_id: ChainId,
    iteration: u32,
    chain_key: ChainKey,
    signature: Signature,
}

fn signed_bytes(
    conversation: &ConversationId,
    sender: &UserId,
    recipient: &UserId,
    chain_id: ChainId,
    iteration: u32,
    chain_key: &ChainKey,
) -> Result<Vec<u8>, EncodeError> {
    encode_cbor(&(conversation, sender, recipient, chain_id, iteration, chain_key))
}

fn distribution_aad(
    conversation: &ConversationId,
    sender: &UserId,
    recipient: &UserId,
) -> Result<Vec<u8>, EncodeError> {
    encode_cbor(&(conversation, sender, recipient))
}

fn message_aad(
    conversation: &ConversationId,
    sender: &UserId,
    chain_id: ChainId,
    iteration: u32,
) -> Result<Vec<u8>, EncodeError> {
    encode_cbor(&(conversation, sender, chain_id, iteration))
}

impl SenderKey {
    pub fn init(conversation: ConversationId) -> SenderKeyState {
        SenderKeyState {
            conversation,
            own: None,
            received: BTreeMap::new(),
        }
    }

    /// Creates a fresh sender chain for us, replacing an existing one.
    pub fn create_chain<E: CryptoEngine>(
        mut y: SenderKeyState,
        engine: &E,
    ) -> Result<SenderKeyState, SenderKeyError> {
        y.own = Some(SenderChain {
            chain_id: engine.random_u32()?,
            iteration: 0,
            chain_key: ChainKey::from_bytes(engine.random_array()?),
        });
        Ok(y)
    }

    /// Wraps the current state of our chain for one recipient.
    ///
    /// The recipient can decrypt our messages from the current iteration onwards.
    pub fn distribute<E: CryptoEngine>(
        y: &SenderKeyState,
        sender: &UserId,
        our_identity: &IdentityKeyPair,
        recipient: &UserId,
        recipient_identity: &IdentityKey,
        engine: &E,
    ) -> Result<SenderKeyDistribution, SenderKeyError> {
        let chain = y.own.as_ref().ok_or(SenderKeyError::NoOwnChain)?;

        let signature = engine.sign(
            our_identity.signing_key(),
            &signed_bytes(
                &y.conversation,
                sender,
                recipient,
                chain.chain_id,
                chain.iteration,
                &chain.chain_key,
            )?,
        )?;

        let payload = encode_cbor(&DistributionPayload {
            chain_id: chain.chain_id,
            iteration: chain.iteration,
            chain_key: chain.chain_key.clone(),
            signature,
        })?;

        let ciphertext = engine.kem_encapsulate(
            recipient_identity.kem(),
            DISTRIBUTION_INFO,
            &distribution_aad(&y.conversation, sender, recipient)?,
            &payload,
        )?;

        Ok(SenderKeyDistribution {
            conversation: y.conversation.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            ciphertext,
        })
    }

    /// Unwraps and verifies a distribution addressed to us.
    ///
    /// Receiving the same chain again keeps the copy we already have, so duplicates never move our
    /// position in the chain. A distribution with another chain id replaces the old chain.
    pub fn receive_distribution<E: CryptoEngine>(
        mut y: SenderKeyState,
        distribution: &SenderKeyDistribution,
        sender_identity: &IdentityKey,
        our_identity: &IdentityKeyPair,
        engine: &E,
    ) -> Result<SenderKeyState, SenderKeyError> {
        if distribution.conversation != y.conversation {
            return Err(SenderKeyError::ConversationMismatch(
                distribution.conversation.clone(),
            ));
        }

        let plaintext = engine.kem_decapsulate(
            our_identity.kem_secret(),
            DISTRIBUTION_INFO,
            &distribution_aad(
                &distribution.conversation,
                &distribution.sender,
                &distribution.recipient,
            )?,
            &distribution.ciphertext,
        )?;
        let payload: DistributionPayload = decode_cbor(&plaintext[..])?;

        engine.verify(
            sender_identity.signing(),
            &signed_bytes(
                &distribution.conversation,
                &distribution.sender,
                &distribution.recipient,
                payload.chain_id,
                payload.iteration,
                &payload.chain_key,
            )?,
            &payload.signature,
        )?;

        if let Some(existing) = y.received.get(&distribution.sender) {
            if existing.chain_id == payload.chain_id {
                return Ok(y);
            }
        }

        y.received.insert(
            distribution.sender.clone(),
            ReceivedChain {
                chain_id: payload.chain_id,
                iteration: payload.iteration,
                chain_key: payload.chain_key,
                skipped: VecDeque::new(),
            },
        );

        Ok(y)
    }

    /// Encrypts a message with the next key of our chain.
    pub fn encrypt<E: CryptoEngine>(
        mut y: SenderKeyState,
        sender: &UserId,
        plaintext: &[u8],
        engine: &E,
    ) -> Result<(SenderKeyState, GroupMessage), SenderKeyError> {
        let conversation = y.conversation.clone();
        let chain = y.own.as_mut().ok_or(SenderKeyError::NoOwnChain)?;

        let (next_chain_key, message_key) = chain.chain_key.step(engine)?;
        let aad = message_aad(&conversation, sender, chain.chain_id, chain.iteration)?;
        let ciphertext = engine.aead_seal(&message_key, plaintext, &aad)?;

        let message = GroupMessage {
            sender: sender.clone(),
            chain_id: chain.chain_id,
            iteration: chain.iteration,
            ciphertext,
        };

        chain.chain_key = next_chain_key;
        chain.iteration = chain
            .iteration
            .checked_add(1)
            .ok_or(SenderKeyError::ChainExhausted)?;

        Ok((y, message))
    }

    /// Decrypts a message of another member, deriving their chain forward if needed.
    pub fn decrypt<E: CryptoEngine>(
        mut y: SenderKeyState,
        message: &GroupMessage,
        limits: &SkipLimits,
        engine: &E,
    ) -> Result<(SenderKeyState, Vec<u8>), SenderKeyError> {
        let aad = message_aad(
            &y.conversation,
            &message.sender,
            message.chain_id,
            message.iteration,
        )?;

        let chain = y
            .received
            .get_mut(&message.sender)
            .ok_or_else(|| SenderKeyError::UnknownSender(message.sender.clone()))?;

        if chain.chain_id != message.chain_id {
            return Err(SenderKeyError::UnknownChain(message.chain_id));
        }

        if message.iteration < chain.iteration {
            let index = chain
                .skipped
                .iter()
                .position(|(iteration, _)| *iteration == message.iteration)
                .ok_or(SenderKeyError::MessageKeyUnavailable(message.iteration))?;
            let (_, message_key) = chain
                .skipped
                .remove(index)
                .ok_or(SenderKeyError::MessageKeyUnavailable(message.iteration))?;
            let plaintext = engine.aead_open(&message_key, &message.ciphertext, &aad)?;
            return Ok((y, plaintext));
        }

        let skip = message.iteration - chain.iteration;
        if skip > limits.max_skip {
            return Err(SenderKeyError::TooManySkipped(skip));
        }

        let mut chain_key = chain.chain_key.clone();
        let mut skipped = Vec::new();
        for iteration in chain.iteration..message.iteration {
            let (next_chain_key, message_key) = chain_key.step(engine)?;
            skipped.push((iteration, message_key));
            chain_key = next_chain_key;
        }
        let (next_chain_key, message_key) = chain_key.step(engine)?;

        // Open before touching the chain, a forged message must not move it forward.
        let plaintext = engine.aead_open(&message_key, &message.ciphertext, &aad)?;

        chain.skipped.extend(skipped);
        while chain.skipped.len() > limits.max_skipped_keys {
            chain.skipped.pop_front();
        }
        chain.chain_key = next_chain_key;
        chain.iteration = message.iteration.saturating_add(1);

        Ok((y, plaintext))
    }
}

#[derive(Debug, Error)]
pub enum SenderKeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no own sender chain created for this group")]
    NoOwnChain,

    #[error("no sender chain received from {0}")]
    UnknownSender(UserId),

    #[error("unknown sender chain {0}")]
    UnknownChain(ChainId),

    #[error("distribution belongs to conversation {0}")]
    ConversationMismatch(ConversationId),

    #[error("message key of iteration {0} was already used or predates our copy of the chain")]
    MessageKeyUnavailable(u32),

    #[error("message would skip {0} iterations, exceeding the limit")]
    TooManySkipped(u32),

    #[error("sender chain reached its maximum length")]
    ChainExhausted,
}

impl SenderKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SenderKeyError::Crypto(err) => err.kind(),
            SenderKeyError::NoOwnChain
            | SenderKeyError::UnknownSender(_)
            | SenderKeyError::UnknownChain(_) => ErrorKind::MissingKey,
            SenderKeyError::MessageKeyUnavailable(_)
            | SenderKeyError::TooManySkipped(_)
            | SenderKeyError::ConversationMismatch(_) => ErrorKind::Verification,
            SenderKeyError::Encode(_)
            | SenderKeyError::Decode(_)
            | SenderKeyError::ChainExhausted => ErrorKind::Internal,
        }
    }
}
