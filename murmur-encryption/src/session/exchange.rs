// SPDX-License-Identifier: MIT OR Apache-2.0

//! Asynchronous session establishment through pending key exchanges on the directory.
//!
//! The initiator runs X3DH against the responder's prekey bundle, derives its ratchet state and
//! publishes a key exchange addressed to the responder. The responder picks it up whenever it
//! opens the conversation and derives the matching state from its prekey secrets.
use murmur_core::{ConversationId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoEngine;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::key_bundle::{OneTimePreKeyId, PreKeyId, PrekeyBundle};
use crate::sealed::SealedBlob;
use crate::session::{Ratchet, RatchetError, SessionState, X3dhError, x3dh_initiate, x3dh_respond};

/// Public part of a key exchange the responder needs to derive the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeOffer {
    pub initiator_identity: IdentityKey,
    pub ephemeral_key: PublicKey,

    /// First ratchet public key of the initiator.
    pub ratchet_key: PublicKey,

    /// Signed prekey of the responder used in X3DH.
    pub signed_prekey_id: PreKeyId,

    /// One-time prekey of the responder used in X3DH, if the bundle carried one.
    pub onetime_prekey_id: Option<OneTimePreKeyId>,
}

/// Key exchange record kept on the directory until the responder accepted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKeyExchange {
    pub conversation: ConversationId,
    pub initiator: UserId,
    pub responder: UserId,
    pub offer: KeyExchangeOffer,

    /// Initiator's own session state, sealed under its device key, to restore the session on a
    /// device which lost its local copy before the responder accepted.
    pub initiator_state: SealedBlob,
}

pub struct KeyExchange;

impl KeyExchange {
    /// Runs X3DH as initiator and returns the initial session state together with the offer for
    /// the responder.
    pub fn initiate<E: CryptoEngine>(
        conversation: ConversationId,
        our_identity: &IdentityKeyPair,
        their_prekey_bundle: &PrekeyBundle,
        engine: &E,
    ) -> Result<(SessionState, KeyExchangeOffer), EstablishError> {
        let (shared_secret, ephemeral_key) =
            x3dh_initiate(our_identity, their_prekey_bundle, engine)?;

        let y = Ratchet::init_initiator(
            conversation,
            shared_secret,
            *their_prekey_bundle.identity_key(),
            *their_prekey_bundle.signed_prekey(),
            engine,
        )?;

        let offer = KeyExchangeOffer {
            initiator_identity: our_identity.public_key(),
            ephemeral_key,
            ratchet_key: y.ratchet_key(),
            signed_prekey_id: their_prekey_bundle.signed_prekey_id(),
            onetime_prekey_id: their_prekey_bundle.onetime_prekey_id(),
        };

        Ok((y, offer))
    }

    /// Derives the responder's session state from an offer.
    ///
    /// The caller looks up the prekey secrets the offer refers to. When the directory knows an
    /// identity key for the initiator, the offer has to carry the same one.
    pub fn accept<E: CryptoEngine>(
        conversation: ConversationId,
        offer: &KeyExchangeOffer,
        expected_identity: Option<&IdentityKey>,
        our_identity: &IdentityKeyPair,
        our_prekey_secret: &SecretKey,
        our_onetime_secret: Option<&SecretKey>,
        engine: &E,
    ) -> Result<SessionState, EstablishError> {
        if let Some(expected) = expected_identity {
            if expected != &offer.initiator_identity {
                return Err(EstablishError::IdentityMismatch);
            }
        }

        let shared_secret = x3dh_respond(
            &offer.initiator_identity,
            &offer.ephemeral_key,
            our_identity,
            our_prekey_secret,
            our_onetime_secret,
            engine,
        )?;

        let y = Ratchet::init_responder(
            conversation,
            shared_secret,
            offer.initiator_identity,
            offer.ratchet_key,
            our_prekey_secret,
            engine,
        )?;

        Ok(y)
    }
}

#[derive(Debug, Error)]
pub enum EstablishError {
    #[error(transparent)]
    X3dh(#[from] X3dhError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error("identity key in key exchange does not match the one on the directory")]
    IdentityMismatch,
}

impl EstablishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EstablishError::X3dh(err) => err.kind(),
            EstablishError::Ratchet(err) => err.kind(),
            EstablishError::IdentityMismatch => ErrorKind::Verification,
        }
    }
}
