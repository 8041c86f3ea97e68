// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{Signature, SigningKey};
use crate::crypto::x25519::PublicKey;
use crate::crypto::{CryptoEngine, CryptoError};
use crate::key_bundle::{Lifetime, LifetimeError};

/// Signed prekeys are identified by their public key.
pub type PreKeyId = PublicKey;

/// Medium-term prekey for X3DH key agreement, to be used until its lifetime has expired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey(PublicKey, Lifetime);

impl PreKey {
    pub fn new(prekey: PublicKey, lifetime: Lifetime) -> Self {
        Self(prekey, lifetime)
    }

    pub fn id(&self) -> PreKeyId {
        self.0
    }

    pub fn key(&self) -> &PublicKey {
        &self.0
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.1
    }

    /// Bytes covered by the prekey signature: the public key followed by its lifetime.
    pub fn to_signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(48);
        bytes.extend_from_slice(self.0.as_bytes());
        bytes.extend_from_slice(&self.1.to_bytes());
        bytes
    }

    pub fn sign<E: CryptoEngine>(
        &self,
        signing_key: &SigningKey,
        engine: &E,
    ) -> Result<Signature, CryptoError> {
        engine.sign(signing_key, &self.to_signed_bytes())
    }

    pub fn verify_lifetime(&self) -> Result<(), LifetimeError> {
        self.1.verify()
    }
}

/// Unique identifier of a user's one-time prekey.
pub type OneTimePreKeyId = u64;

/// Prekey for X3DH key agreement to be used exactly _once_.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey(PublicKey, OneTimePreKeyId);

impl OneTimePreKey {
    pub fn new(onetime_prekey: PublicKey, id: OneTimePreKeyId) -> Self {
        Self(onetime_prekey, id)
    }

    pub fn key(&self) -> &PublicKey {
        &self.0
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.1
    }
}
