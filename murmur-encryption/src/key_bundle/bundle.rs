// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::Signature;
use crate::crypto::x25519::PublicKey;
use crate::crypto::{CryptoEngine, CryptoError};
use crate::identity::IdentityKey;
use crate::key_bundle::{LifetimeError, OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId};

/// Key material a user uploads to the directory.
///
/// The directory hands out one bundle per handshake and attaches at most one of the uploaded
/// one-time prekeys to it, never the same one twice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPrekeys {
    pub identity_key: IdentityKey,
    pub signed_prekey: PreKey,
    pub prekey_signature: Signature,
    pub onetime_prekeys: Vec<OneTimePreKey>,
}

impl PublishedPrekeys {
    /// Assembles the bundle a peer receives when fetching our prekeys.
    pub fn bundle(&self, onetime_prekey: Option<OneTimePreKey>) -> PrekeyBundle {
        PrekeyBundle::new(
            self.identity_key,
            self.signed_prekey,
            self.prekey_signature.clone(),
            onetime_prekey,
        )
    }
}

/// Public keys of a peer needed to start an X3DH handshake with them.
///
/// A missing one-time prekey is not an error: the handshake then falls back to use the signed
/// prekey only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    identity_key: IdentityKey,
    signed_prekey: PreKey,
    prekey_signature: Signature,
    onetime_prekey: Option<OneTimePreKey>,
}

impl PrekeyBundle {
    pub fn new(
        identity_key: IdentityKey,
        signed_prekey: PreKey,
        prekey_signature: Signature,
        onetime_prekey: Option<OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key,
            signed_prekey,
            prekey_signature,
            onetime_prekey,
        }
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn signed_prekey(&self) -> &PublicKey {
        self.signed_prekey.key()
    }

    pub fn signed_prekey_id(&self) -> PreKeyId {
        self.signed_prekey.id()
    }

    pub fn onetime_prekey(&self) -> Option<&PublicKey> {
        self.onetime_prekey.as_ref().map(|key| key.key())
    }

    pub fn onetime_prekey_id(&self) -> Option<OneTimePreKeyId> {
        self.onetime_prekey.as_ref().map(|key| key.id())
    }

    /// Checks the lifetime of the signed prekey and its signature by the identity key.
    pub fn verify<E: CryptoEngine>(&self, engine: &E) -> Result<(), KeyBundleError> {
        self.signed_prekey.verify_lifetime()?;

        engine
            .verify(
                self.identity_key.signing(),
                &self.signed_prekey.to_signed_bytes(),
                &self.prekey_signature,
            )
            .map_err(KeyBundleError::Signature)?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("invalid prekey signature: {0}")]
    Signature(CryptoError),

    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
}
