// SPDX-License-Identifier: MIT OR Apache-2.0

//! Facade over all cryptographic operations used by the protocols.
//!
//! Protocol code never calls a primitive directly but goes through [`CryptoEngine`], which keeps
//! the choice of algorithms in one place and allows injecting deterministic engines in tests.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::{Signature, SignatureError, SigningKey, VerifyingKey};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::hpke::{HpkeCiphertext, HpkeError, hpke_open, hpke_seal};
use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::{PublicKey, SHARED_SECRET_SIZE, SecretKey, X25519Error};
use crate::crypto::xchacha20::{XAeadError, XAeadNonce, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Rng, RngError, Secret};
use crate::error::ErrorKind;

pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Symmetric key for authenticated encryption.
pub type SymmetricKey = Secret<SYMMETRIC_KEY_SIZE>;

/// Ciphertext with attached authentication tag and the random nonce it was sealed with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadCiphertext {
    #[serde(with = "serde_bytes")]
    pub nonce: XAeadNonce,

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

pub trait CryptoEngine {
    fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError>;

    fn random_u32(&self) -> Result<u32, CryptoError>;

    fn new_symmetric_key(&self) -> Result<SymmetricKey, CryptoError> {
        Ok(Secret::from_bytes(self.random_array()?))
    }

    fn new_kem_secret(&self) -> Result<SecretKey, CryptoError> {
        Ok(SecretKey::from_bytes(self.random_array()?))
    }

    fn new_signing_key(&self) -> Result<SigningKey, CryptoError> {
        Ok(SigningKey::from_bytes(self.random_array()?))
    }

    /// Key derivation from input key material, bound to a salt and context string.
    fn derive_key<const N: usize>(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
    ) -> Result<[u8; N], CryptoError>;

    /// Diffie-Hellman agreement between our secret and their public key.
    fn agree(
        &self,
        our_secret: &SecretKey,
        their_public: &PublicKey,
    ) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError>;

    /// Authenticated encryption under a fresh random nonce.
    fn aead_seal(
        &self,
        key: &SymmetricKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<AeadCiphertext, CryptoError>;

    fn aead_open(
        &self,
        key: &SymmetricKey,
        ciphertext: &AeadCiphertext,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encapsulates a fresh shared secret for the holder of `public_key` and encrypts the payload
    /// with it.
    fn kem_encapsulate(
        &self,
        public_key: &PublicKey,
        info: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<HpkeCiphertext, CryptoError>;

    fn kem_decapsulate(
        &self,
        secret_key: &SecretKey,
        info: &[u8],
        aad: &[u8],
        ciphertext: &HpkeCiphertext,
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, signing_key: &SigningKey, bytes: &[u8]) -> Result<Signature, CryptoError>;

    fn verify(
        &self,
        verifying_key: &VerifyingKey,
        bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError>;

    fn hash(&self, messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE];
}

/// Default engine backed by RustCrypto and dalek implementations.
#[derive(Debug, Default)]
pub struct Crypto {
    rng: Rng,
}

#[cfg(any(test, feature = "test_utils"))]
impl Crypto {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Rng::from_seed(seed),
        }
    }
}

impl CryptoEngine for Crypto {
    fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        Ok(self.rng.random_array()?)
    }

    fn random_u32(&self) -> Result<u32, CryptoError> {
        Ok(self.rng.random_u32()?)
    }

    fn derive_key<const N: usize>(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
    ) -> Result<[u8; N], CryptoError> {
        Ok(hkdf(salt, ikm, info)?)
    }

    fn agree(
        &self,
        our_secret: &SecretKey,
        their_public: &PublicKey,
    ) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
        Ok(our_secret.calculate_agreement(their_public)?)
    }

    fn aead_seal(
        &self,
        key: &SymmetricKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<AeadCiphertext, CryptoError> {
        let nonce: XAeadNonce = self.rng.random_array()?;
        let ciphertext = x_aead_encrypt(key.as_bytes(), plaintext, nonce, aad)?;
        Ok(AeadCiphertext { nonce, ciphertext })
    }

    fn aead_open(
        &self,
        key: &SymmetricKey,
        ciphertext: &AeadCiphertext,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(x_aead_decrypt(
            key.as_bytes(),
            &ciphertext.ciphertext,
            ciphertext.nonce,
            aad,
        )?)
    }

    fn kem_encapsulate(
        &self,
        public_key: &PublicKey,
        info: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<HpkeCiphertext, CryptoError> {
        Ok(hpke_seal(public_key, info, aad, plaintext)?)
    }

    fn kem_decapsulate(
        &self,
        secret_key: &SecretKey,
        info: &[u8],
        aad: &[u8],
        ciphertext: &HpkeCiphertext,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(hpke_open(ciphertext, secret_key, info, aad)?)
    }

    fn sign(&self, signing_key: &SigningKey, bytes: &[u8]) -> Result<Signature, CryptoError> {
        Ok(signing_key.sign(bytes))
    }

    fn verify(
        &self,
        verifying_key: &VerifyingKey,
        bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        Ok(verifying_key.verify(bytes, signature)?)
    }

    fn hash(&self, messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
        sha2_256(messages)
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    Hpke(#[from] HpkeError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::XAead(XAeadError::Decrypt(_))
            | CryptoError::Hpke(HpkeError::Decryption(_))
            | CryptoError::X25519(_)
            | CryptoError::Signature(_) => ErrorKind::Verification,
            _ => ErrorKind::Internal,
        }
    }
}
