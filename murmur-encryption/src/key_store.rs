// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key material store, the single writer of all our secret state.
//!
//! Every piece of state is sealed under the device key before it is handed to the persistence
//! service. The key manager state is additionally cached in memory, as it is needed for every
//! handshake.
use std::sync::Arc;
use std::time::Duration;

use murmur_core::{ConversationId, UserId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel_key::ChannelKeyRing;
use crate::conversation_key::ConversationKey;
use crate::crypto::x25519::SecretKey;
use crate::crypto::{CryptoEngine, CryptoError};
use crate::error::ErrorKind;
use crate::identity::IdentityKeyPair;
use crate::key_bundle::{
    Lifetime, OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId, PublishedPrekeys,
};
use crate::key_manager::{KeyManager, KeyManagerError, KeyManagerState};
use crate::sealed::{BlobKey, DeviceKey, SealError, SealedBlob};
use crate::sender_key::SenderKeyState;
use crate::session::SessionState;
use crate::traits::Persistence;

pub struct KeyStore<P, E> {
    persistence: P,
    device_key: DeviceKey,
    engine: Arc<E>,
    key_manager: Mutex<Option<KeyManagerState>>,
}

impl<P, E> KeyStore<P, E>
where
    P: Persistence,
    E: CryptoEngine,
{
    pub fn new(persistence: P, device_key: DeviceKey, engine: Arc<E>) -> Self {
        Self {
            persistence,
            device_key,
            engine,
            key_manager: Mutex::new(None),
        }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Loads and opens a sealed blob.
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &BlobKey,
    ) -> Result<Option<T>, KeyStoreError<P>> {
        let Some(blob) = self
            .persistence
            .load_blob(key)
            .await
            .map_err(KeyStoreError::Persistence)?
        else {
            return Ok(None);
        };
        Ok(Some(blob.open(&self.device_key, key, self.engine.as_ref())?))
    }

    /// Seals and stores a value.
    pub async fn store<T: Serialize>(
        &self,
        key: &BlobKey,
        value: &T,
    ) -> Result<(), KeyStoreError<P>> {
        let blob = self.seal(key, value)?;
        self.persistence
            .store_blob(key, &blob)
            .await
            .map_err(KeyStoreError::Persistence)
    }

    pub fn seal<T: Serialize>(
        &self,
        key: &BlobKey,
        value: &T,
    ) -> Result<SealedBlob, KeyStoreError<P>> {
        Ok(SealedBlob::seal(
            &self.device_key,
            key,
            value,
            self.engine.as_ref(),
        )?)
    }

    pub fn open<T: DeserializeOwned>(
        &self,
        key: &BlobKey,
        blob: &SealedBlob,
    ) -> Result<T, KeyStoreError<P>> {
        Ok(blob.open(&self.device_key, key, self.engine.as_ref())?)
    }

    // Identity and prekeys.

    /// Creates the identity of this account together with its first signed prekey.
    ///
    /// Fails if an identity exists already, it can never be replaced.
    pub async fn generate_identity(
        &self,
        lifetime: Lifetime,
    ) -> Result<IdentityKeyPair, KeyStoreError<P>> {
        let mut cache = self.key_manager.lock().await;
        if cache.is_some() || self.load::<KeyManagerState>(&BlobKey::KeyManager).await?.is_some() {
            return Err(KeyStoreError::IdentityExists);
        }

        let identity = IdentityKeyPair::generate(self.engine.as_ref())?;
        let y = KeyManager::init(identity.clone(), lifetime, self.engine.as_ref())?;
        self.store(&BlobKey::KeyManager, &y).await?;
        *cache = Some(y);

        debug!(identity = %identity.public_key(), "generated new identity");
        Ok(identity)
    }

    pub async fn load_identity(&self) -> Result<IdentityKeyPair, KeyStoreError<P>> {
        self.read_key_manager(|y| Ok(KeyManager::identity(y).clone()))
            .await
    }

    /// Generates a new signed prekey, superseded ones are kept until they expire.
    pub async fn rotate_signed_prekey(
        &self,
        lifetime: Lifetime,
    ) -> Result<PreKey, KeyStoreError<P>> {
        let engine = self.engine.clone();
        self.update_key_manager(|y| {
            let y = KeyManager::rotate_prekey(y, lifetime, engine.as_ref())?;
            let prekey = KeyManager::published_prekeys(&y, Vec::new())?.signed_prekey;
            Ok((y, prekey))
        })
        .await
    }

    pub async fn needs_rotation(&self, rotate_after: Duration) -> Result<bool, KeyStoreError<P>> {
        self.read_key_manager(|y| Ok(KeyManager::needs_rotation(y, rotate_after)))
            .await
    }

    pub async fn draw_onetime_prekey(&self) -> Result<OneTimePreKey, KeyStoreError<P>> {
        self.update_key_manager(KeyManager::draw_onetime_prekey)
            .await
    }

    /// Tops up the one-time prekeys until `target` unused ones exist, returns how many were
    /// generated.
    pub async fn replenish_onetime_prekeys(
        &self,
        target: usize,
    ) -> Result<usize, KeyStoreError<P>> {
        let engine = self.engine.clone();
        self.update_key_manager(|y| {
            let before = KeyManager::onetime_prekeys_available(&y);
            let y = KeyManager::replenish_onetime_prekeys(y, target, engine.as_ref())?;
            let generated = KeyManager::onetime_prekeys_available(&y) - before;
            Ok((y, generated))
        })
        .await
    }

    /// Composes the upload for the directory: our latest signed prekey and all one-time prekeys
    /// which were not uploaded yet.
    pub async fn published_prekeys(&self) -> Result<PublishedPrekeys, KeyStoreError<P>> {
        self.update_key_manager(|mut y| {
            let mut onetime_prekeys = Vec::new();
            loop {
                match KeyManager::draw_onetime_prekey(y.clone()) {
                    Ok((next, onetime_prekey)) => {
                        y = next;
                        onetime_prekeys.push(onetime_prekey);
                    }
                    Err(KeyManagerError::OneTimePreKeysExhausted) => break,
                    Err(err) => return Err(err),
                }
            }
            let published = KeyManager::published_prekeys(&y, onetime_prekeys)?;
            Ok((y, published))
        })
        .await
    }

    /// Removes and returns a one-time prekey secret, it can not be used a second time.
    pub async fn use_onetime_secret(
        &self,
        id: OneTimePreKeyId,
    ) -> Result<SecretKey, KeyStoreError<P>> {
        self.update_key_manager(|y| KeyManager::use_onetime_secret(y, id))
            .await
    }

    pub async fn prekey_secret(&self, id: &PreKeyId) -> Result<SecretKey, KeyStoreError<P>> {
        self.read_key_manager(|y| Ok(KeyManager::prekey_secret(y, id)?.clone()))
            .await
    }

    pub async fn onetime_prekeys_available(&self) -> Result<usize, KeyStoreError<P>> {
        self.read_key_manager(|y| Ok(KeyManager::onetime_prekeys_available(y)))
            .await
    }

    pub async fn remove_expired_prekeys(&self) -> Result<(), KeyStoreError<P>> {
        self.update_key_manager(|y| Ok((KeyManager::remove_expired(y), ())))
            .await
    }

    async fn read_key_manager<T>(
        &self,
        f: impl FnOnce(&KeyManagerState) -> Result<T, KeyManagerError>,
    ) -> Result<T, KeyStoreError<P>> {
        let mut cache = self.key_manager.lock().await;
        if cache.is_none() {
            *cache = self.load(&BlobKey::KeyManager).await?;
        }
        let y = cache.as_ref().ok_or(KeyStoreError::IdentityNotFound)?;
        Ok(f(y)?)
    }

    /// Applies a change to the key manager state and persists it before the cache is updated.
    async fn update_key_manager<T>(
        &self,
        f: impl FnOnce(KeyManagerState) -> Result<(KeyManagerState, T), KeyManagerError>,
    ) -> Result<T, KeyStoreError<P>> {
        let mut cache = self.key_manager.lock().await;
        if cache.is_none() {
            *cache = self.load(&BlobKey::KeyManager).await?;
        }
        let y = cache.clone().ok_or(KeyStoreError::IdentityNotFound)?;
        let (y, output) = f(y)?;
        self.store(&BlobKey::KeyManager, &y).await?;
        *cache = Some(y);
        Ok(output)
    }

    // Sessions.

    pub async fn get_session(
        &self,
        conversation: &ConversationId,
        peer: &UserId,
    ) -> Result<Option<SessionState>, KeyStoreError<P>> {
        self.load(&Self::session_key(conversation, peer)).await
    }

    pub async fn put_session(
        &self,
        conversation: &ConversationId,
        peer: &UserId,
        y: &SessionState,
    ) -> Result<(), KeyStoreError<P>> {
        self.store(&Self::session_key(conversation, peer), y).await
    }

    pub fn session_key(conversation: &ConversationId, peer: &UserId) -> BlobKey {
        BlobKey::Session {
            conversation: conversation.clone(),
            peer: peer.clone(),
        }
    }

    // Group, channel and conversation keys.

    pub async fn sender_keys(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<SenderKeyState>, KeyStoreError<P>> {
        self.load(&BlobKey::SenderKeys(conversation.clone())).await
    }

    pub async fn put_sender_keys(&self, y: &SenderKeyState) -> Result<(), KeyStoreError<P>> {
        self.store(&BlobKey::SenderKeys(y.conversation().clone()), y)
            .await
    }

    pub async fn channel_keys(
        &self,
        channel: &ConversationId,
    ) -> Result<Option<ChannelKeyRing>, KeyStoreError<P>> {
        self.load(&BlobKey::ChannelKeys(channel.clone())).await
    }

    pub async fn put_channel_keys(&self, y: &ChannelKeyRing) -> Result<(), KeyStoreError<P>> {
        self.store(&BlobKey::ChannelKeys(y.channel().clone()), y)
            .await
    }

    pub async fn conversation_key(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationKey>, KeyStoreError<P>> {
        self.load(&BlobKey::ConversationKey(conversation.clone()))
            .await
    }

    pub async fn put_conversation_key(
        &self,
        conversation: &ConversationId,
        key: &ConversationKey,
    ) -> Result<(), KeyStoreError<P>> {
        self.store(&BlobKey::ConversationKey(conversation.clone()), key)
            .await
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError<P: Persistence> {
    #[error("persistence service failed: {0}")]
    Persistence(P::Error),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    KeyManager(#[from] KeyManagerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("no identity found, it needs to be generated first")]
    IdentityNotFound,

    #[error("identity exists already")]
    IdentityExists,
}

impl<P: Persistence> KeyStoreError<P> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyStoreError::Persistence(_) => ErrorKind::Transport,
            KeyStoreError::Seal(err) => err.kind(),
            KeyStoreError::KeyManager(err) => err.kind(),
            KeyStoreError::Crypto(err) => err.kind(),
            KeyStoreError::IdentityNotFound => ErrorKind::MissingKey,
            KeyStoreError::IdentityExists => ErrorKind::Internal,
        }
    }
}
