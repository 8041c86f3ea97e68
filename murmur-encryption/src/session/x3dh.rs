// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement protocol as specified by Signal.
//!
//! X3DH establishes a shared secret key between two parties who mutually authenticate each other
//! based on public keys. It is designed for asynchronous settings where the responder is offline
//! but has published a prekey bundle on the directory. The initiator uses that bundle to derive
//! the secret right away, the responder derives the same secret later from the initiator's
//! identity and ephemeral key.
//!
//! The shared secret seeds the root key of the direct-message ratchet.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{CryptoEngine, CryptoError, Secret};
use crate::error::ErrorKind;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::key_bundle::{KeyBundleError, PrekeyBundle};

/// ASCII string identifying the application as specified in X3DH used for KDF.
const KDF_INFO: &[u8] = b"murmur-x3dh";

pub const SHARED_SECRET_SIZE: usize = 32;

/// Result of a successful X3DH run, identical on both sides.
#[derive(Debug)]
pub struct SharedSecret {
    pub secret: Secret<SHARED_SECRET_SIZE>,

    /// Identities of initiator and responder, bound to every message of the session.
    pub associated_data: Vec<u8>,
}

fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&initiator.to_bytes());
    buf.extend_from_slice(&responder.to_bytes());
    buf
}

fn derive_secret<E: CryptoEngine>(
    ikm: &[u8],
    engine: &E,
) -> Result<Secret<SHARED_SECRET_SIZE>, CryptoError> {
    let salt = [0u8; 32];
    Ok(Secret::from_bytes(engine.derive_key(&salt, ikm, KDF_INFO)?))
}

/// Runs X3DH as initiator against a verified prekey bundle.
///
/// Returns the shared secret and the ephemeral public key the responder needs to derive it.
pub fn x3dh_initiate<E: CryptoEngine>(
    our_identity: &IdentityKeyPair,
    their_prekey_bundle: &PrekeyBundle,
    engine: &E,
) -> Result<(SharedSecret, PublicKey), X3dhError> {
    their_prekey_bundle.verify(engine)?;

    let their_identity_key = their_prekey_bundle.identity_key();
    let our_ephemeral_secret = engine.new_kem_secret()?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));

    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IKA, SPKB)
    ikm.extend_from_slice(&engine.agree(
        our_identity.kem_secret(),
        their_prekey_bundle.signed_prekey(),
    )?);

    // DH2 = DH(EKA, IKB)
    ikm.extend_from_slice(&engine.agree(&our_ephemeral_secret, their_identity_key.kem())?);

    // DH3 = DH(EKA, SPKB)
    ikm.extend_from_slice(&engine.agree(
        &our_ephemeral_secret,
        their_prekey_bundle.signed_prekey(),
    )?);

    // DH4 = DH(EKA, OPKB)
    if let Some(onetime_prekey) = their_prekey_bundle.onetime_prekey() {
        ikm.extend_from_slice(&engine.agree(&our_ephemeral_secret, onetime_prekey)?);
    }

    let shared_secret = SharedSecret {
        secret: derive_secret(&ikm, engine)?,
        associated_data: associated_data(&our_identity.public_key(), their_identity_key),
    };

    Ok((shared_secret, our_ephemeral_secret.public_key()))
}

/// Runs X3DH as responder with the secrets belonging to the prekeys the initiator used.
pub fn x3dh_respond<E: CryptoEngine>(
    their_identity_key: &IdentityKey,
    their_ephemeral_key: &PublicKey,
    our_identity: &IdentityKeyPair,
    our_prekey_secret: &SecretKey,
    our_onetime_secret: Option<&SecretKey>,
    engine: &E,
) -> Result<SharedSecret, X3dhError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));

    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IKA, SPKB)
    ikm.extend_from_slice(&engine.agree(our_prekey_secret, their_identity_key.kem())?);

    // DH2 = DH(EKA, IKB)
    ikm.extend_from_slice(&engine.agree(our_identity.kem_secret(), their_ephemeral_key)?);

    // DH3 = DH(EKA, SPKB)
    ikm.extend_from_slice(&engine.agree(our_prekey_secret, their_ephemeral_key)?);

    // DH4 = DH(EKA, OPKB)
    if let Some(our_onetime_secret) = our_onetime_secret {
        ikm.extend_from_slice(&engine.agree(our_onetime_secret, their_ephemeral_key)?);
    }

    Ok(SharedSecret {
        secret: derive_secret(&ikm, engine)?,
        associated_data: associated_data(their_identity_key, &our_identity.public_key()),
    })
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl X3dhError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            X3dhError::KeyBundle(_) => ErrorKind::Verification,
            X3dhError::Crypto(err) => err.kind(),
        }
    }
}
