// SPDX-License-Identifier: MIT OR Apache-2.0

//! Manager for our own secret key material.
//!
//! Signed prekeys should be rotated in good time before they expire, so peers who are offline for
//! a while still find a valid one on the directory. Superseded prekeys are kept until their
//! lifetime ended to finish handshakes which are still in flight.
//!
//! One-time prekeys are generated in batches. A freshly generated one-time prekey is "unpublished"
//! until it gets drawn for upload to the directory, its secret is kept until a peer used it in a
//! handshake and is deleted the moment we accept that handshake.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::Signature;
use crate::crypto::x25519::SecretKey;
use crate::crypto::{CryptoEngine, CryptoError};
use crate::error::ErrorKind;
use crate::identity::IdentityKeyPair;
use crate::key_bundle::{
    Lifetime, LifetimeError, OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId, PublishedPrekeys,
    now,
};

/// Key manager to maintain secret key material (like our identity key) and to generate signed
/// public prekeys.
#[derive(Clone, Debug)]
pub struct KeyManager;

/// Serializable state of key manager (for persistence).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyManagerState {
    identity: IdentityKeyPair,
    prekeys: HashMap<PreKeyId, PreKeyState>,
    onetime_secrets: BTreeMap<OneTimePreKeyId, SecretKey>,
    unpublished: BTreeSet<OneTimePreKeyId>,
    onetime_next_id: OneTimePreKeyId,
}

impl KeyManagerState {
    /// Valid prekey with the longest remaining lifetime.
    fn latest_prekey(&self) -> Option<&PreKeyState> {
        self.prekeys
            .values()
            .filter(|state| state.prekey.verify_lifetime().is_ok())
            .max_by_key(|state| state.prekey.lifetime().not_after())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PreKeyState {
    prekey: PreKey,
    signature: Signature,
    secret: SecretKey,
}

impl PreKeyState {
    fn init<E: CryptoEngine>(
        identity: &IdentityKeyPair,
        lifetime: Lifetime,
        engine: &E,
    ) -> Result<Self, KeyManagerError> {
        let secret = engine.new_kem_secret()?;
        let prekey = PreKey::new(secret.public_key(), lifetime);
        let signature = prekey.sign(identity.signing_key(), engine)?;

        Ok(Self {
            prekey,
            signature,
            secret,
        })
    }
}

impl KeyManager {
    /// Returns newly initialised key-manager state, holding our identity secret and a new signed
    /// prekey.
    pub fn init<E: CryptoEngine>(
        identity: IdentityKeyPair,
        lifetime: Lifetime,
        engine: &E,
    ) -> Result<KeyManagerState, KeyManagerError> {
        let prekey = PreKeyState::init(&identity, lifetime, engine)?;

        Ok(KeyManagerState {
            identity,
            prekeys: HashMap::from([(prekey.prekey.id(), prekey)]),
            onetime_secrets: BTreeMap::new(),
            unpublished: BTreeSet::new(),
            onetime_next_id: 0,
        })
    }

    pub fn identity(y: &KeyManagerState) -> &IdentityKeyPair {
        &y.identity
    }

    /// Generates a new signed prekey with the given lifetime.
    pub fn rotate_prekey<E: CryptoEngine>(
        mut y: KeyManagerState,
        lifetime: Lifetime,
        engine: &E,
    ) -> Result<KeyManagerState, KeyManagerError> {
        let prekey = PreKeyState::init(&y.identity, lifetime, engine)?;
        y.prekeys.insert(prekey.prekey.id(), prekey);
        Ok(y)
    }

    /// Returns true if there is no valid prekey or the latest one is older than `rotate_after`.
    pub fn needs_rotation(y: &KeyManagerState, rotate_after: Duration) -> bool {
        match y.latest_prekey() {
            Some(latest) => {
                let rotate_at = latest
                    .prekey
                    .lifetime()
                    .not_before()
                    .saturating_add(rotate_after.as_secs());
                now() >= rotate_at
            }
            None => true,
        }
    }

    /// Returns the latest signed prekey, ready to be uploaded to the directory together with the
    /// given one-time prekeys.
    ///
    /// Fails when all prekeys expired, applications need to rotate them in this case.
    pub fn published_prekeys(
        y: &KeyManagerState,
        onetime_prekeys: Vec<OneTimePreKey>,
    ) -> Result<PublishedPrekeys, KeyManagerError> {
        let latest = y
            .latest_prekey()
            .ok_or(KeyManagerError::NoPreKeysAvailable)?;

        Ok(PublishedPrekeys {
            identity_key: y.identity.public_key(),
            signed_prekey: latest.prekey,
            prekey_signature: latest.signature.clone(),
            onetime_prekeys,
        })
    }

    /// Returns signed prekey secret by id.
    ///
    /// Throws an error if prekey was not found (for example because it expired and was removed).
    pub fn prekey_secret<'a>(
        y: &'a KeyManagerState,
        id: &PreKeyId,
    ) -> Result<&'a SecretKey, KeyManagerError> {
        match y.prekeys.get(id) {
            Some(prekey) => Ok(&prekey.secret),
            None => Err(KeyManagerError::UnknownPreKeySecret(*id)),
        }
    }

    pub fn generate_onetime_prekeys<E: CryptoEngine>(
        mut y: KeyManagerState,
        count: usize,
        engine: &E,
    ) -> Result<KeyManagerState, KeyManagerError> {
        for _ in 0..count {
            let id = y.onetime_next_id;
            y.onetime_secrets.insert(id, engine.new_kem_secret()?);
            y.unpublished.insert(id);
            y.onetime_next_id += 1;
        }
        Ok(y)
    }

    /// Tops up the supply of one-time prekeys until `target` unused ones exist.
    pub fn replenish_onetime_prekeys<E: CryptoEngine>(
        y: KeyManagerState,
        target: usize,
        engine: &E,
    ) -> Result<KeyManagerState, KeyManagerError> {
        let missing = target.saturating_sub(y.onetime_secrets.len());
        Self::generate_onetime_prekeys(y, missing, engine)
    }

    /// Takes the next unpublished one-time prekey for upload.
    ///
    /// The secret is kept until a peer uses the prekey in a handshake.
    pub fn draw_onetime_prekey(
        mut y: KeyManagerState,
    ) -> Result<(KeyManagerState, OneTimePreKey), KeyManagerError> {
        let id = y
            .unpublished
            .pop_first()
            .ok_or(KeyManagerError::OneTimePreKeysExhausted)?;
        let secret = y
            .onetime_secrets
            .get(&id)
            .ok_or(KeyManagerError::UnknownOneTimeSecret(id))?;
        let onetime_prekey = OneTimePreKey::new(secret.public_key(), id);
        Ok((y, onetime_prekey))
    }

    /// Removes and returns the one-time prekey secret a peer used during X3DH.
    ///
    /// Throws an error when the requested secret is unknown, which means it was already used once
    /// or never existed.
    pub fn use_onetime_secret(
        mut y: KeyManagerState,
        id: OneTimePreKeyId,
    ) -> Result<(KeyManagerState, SecretKey), KeyManagerError> {
        y.unpublished.remove(&id);
        match y.onetime_secrets.remove(&id) {
            Some(secret) => Ok((y, secret)),
            None => Err(KeyManagerError::UnknownOneTimeSecret(id)),
        }
    }

    pub fn onetime_prekeys_available(y: &KeyManagerState) -> usize {
        y.onetime_secrets.len()
    }

    /// Removes all signed prekeys whose lifetime ended.
    pub fn remove_expired(mut y: KeyManagerState) -> KeyManagerState {
        y.prekeys.retain(|_, state| {
            !matches!(
                state.prekey.verify_lifetime(),
                Err(LifetimeError::Expired(_, _))
            )
        });
        y
    }
}

#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("could not find one-time prekey secret with id {0}")]
    UnknownOneTimeSecret(OneTimePreKeyId),

    #[error("could not find prekey secret with id {0}")]
    UnknownPreKeySecret(PreKeyId),

    #[error("no valid prekeys available, they are either expired or too early")]
    NoPreKeysAvailable,

    #[error("no unpublished one-time prekeys left")]
    OneTimePreKeysExhausted,
}

impl KeyManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyManagerError::Crypto(err) => err.kind(),
            KeyManagerError::UnknownOneTimeSecret(_)
            | KeyManagerError::UnknownPreKeySecret(_)
            | KeyManagerError::NoPreKeysAvailable => ErrorKind::MissingKey,
            KeyManagerError::OneTimePreKeysExhausted => ErrorKind::Exhaustion,
        }
    }
}
