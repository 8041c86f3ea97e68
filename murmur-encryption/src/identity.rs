// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-term identity of a user.
//!
//! Every user holds one key-encapsulation key pair (X25519) and one signature key pair (Ed25519).
//! Both are created once for the account and never change afterwards. The secret halves only
//! leave the device sealed under the device key.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{SigningKey, VerifyingKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{CryptoEngine, CryptoError};

/// Public half of an identity, as published on the directory.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    kem: PublicKey,
    signing: VerifyingKey,
}

impl IdentityKey {
    pub fn new(kem: PublicKey, signing: VerifyingKey) -> Self {
        Self { kem, signing }
    }

    /// Key used for Diffie-Hellman agreements and as target when wrapping key material.
    pub fn kem(&self) -> &PublicKey {
        &self.kem
    }

    /// Key used to verify signed prekeys and key distributions.
    pub fn signing(&self) -> &VerifyingKey {
        &self.signing
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.kem.as_bytes());
        bytes[32..].copy_from_slice(self.signing.as_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("kem", &self.kem)
            .field("signing", &self.signing)
            .finish()
    }
}

/// Secret identity key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    kem_secret: SecretKey,
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate<E: CryptoEngine>(engine: &E) -> Result<Self, CryptoError> {
        Ok(Self {
            kem_secret: engine.new_kem_secret()?,
            signing_key: engine.new_signing_key()?,
        })
    }

    pub fn public_key(&self) -> IdentityKey {
        IdentityKey::new(self.kem_secret.public_key(), self.signing_key.verifying_key())
    }

    pub(crate) fn kem_secret(&self) -> &SecretKey {
        &self.kem_secret
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}
