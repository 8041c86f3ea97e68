// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use murmur_core::{ConversationId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::identity::IdentityKey;
use crate::key_bundle::{OneTimePreKey, PrekeyBundle, PublishedPrekeys};
use crate::session::PendingKeyExchange;
use crate::traits::Directory;

#[derive(Debug, Default)]
struct DirectoryInner {
    prekeys: HashMap<UserId, PublishedPrekeys>,
    onetime_prekeys: HashMap<UserId, VecDeque<OneTimePreKey>>,
    exchanges: Vec<PendingKeyExchange>,
    offline: bool,
}

/// Directory shared by all clients of a test.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets every following request fail until the directory is back online.
    pub async fn set_offline(&self, offline: bool) {
        self.inner.write().await.offline = offline;
    }

    pub async fn onetime_prekeys(&self, user: &UserId) -> usize {
        self.inner
            .read()
            .await
            .onetime_prekeys
            .get(user)
            .map_or(0, |pool| pool.len())
    }

    /// Removes all one-time prekeys of the user from the pool.
    pub async fn drain_onetime_prekeys(&self, user: &UserId) {
        self.inner.write().await.onetime_prekeys.remove(user);
    }

    pub async fn pending_exchanges(&self) -> Vec<PendingKeyExchange> {
        self.inner.read().await.exchanges.clone()
    }

    /// Removes all pending key exchanges, to simulate them arriving late.
    pub async fn take_exchanges(&self) -> Vec<PendingKeyExchange> {
        std::mem::take(&mut self.inner.write().await.exchanges)
    }

    async fn check_online(&self) -> Result<(), MemoryDirectoryError> {
        if self.inner.read().await.offline {
            return Err(MemoryDirectoryError::Offline);
        }
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    type Error = MemoryDirectoryError;

    async fn publish_prekeys(
        &self,
        user: &UserId,
        prekeys: &PublishedPrekeys,
    ) -> Result<(), Self::Error> {
        self.check_online().await?;
        let mut inner = self.inner.write().await;
        inner
            .onetime_prekeys
            .entry(user.clone())
            .or_default()
            .extend(prekeys.onetime_prekeys.iter().cloned());
        inner.prekeys.insert(
            user.clone(),
            PublishedPrekeys {
                onetime_prekeys: Vec::new(),
                ..prekeys.clone()
            },
        );
        Ok(())
    }

    async fn fetch_prekey_bundle(
        &self,
        user: &UserId,
    ) -> Result<Option<PrekeyBundle>, Self::Error> {
        self.check_online().await?;
        let mut inner = self.inner.write().await;
        let onetime_prekey = inner
            .onetime_prekeys
            .get_mut(user)
            .and_then(|pool| pool.pop_front());
        Ok(inner
            .prekeys
            .get(user)
            .map(|prekeys| prekeys.bundle(onetime_prekey)))
    }

    async fn identity_key(&self, user: &UserId) -> Result<Option<IdentityKey>, Self::Error> {
        self.check_online().await?;
        Ok(self
            .inner
            .read()
            .await
            .prekeys
            .get(user)
            .map(|prekeys| prekeys.identity_key))
    }

    async fn publish_key_exchange(&self, exchange: &PendingKeyExchange) -> Result<(), Self::Error> {
        self.check_online().await?;
        let mut inner = self.inner.write().await;
        inner.exchanges.retain(|pending| {
            !(pending.conversation == exchange.conversation
                && pending.initiator == exchange.initiator
                && pending.responder == exchange.responder)
        });
        inner.exchanges.push(exchange.clone());
        Ok(())
    }

    async fn key_exchanges(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Vec<PendingKeyExchange>, Self::Error> {
        self.check_online().await?;
        Ok(self
            .inner
            .read()
            .await
            .exchanges
            .iter()
            .filter(|pending| {
                &pending.conversation == conversation
                    && (&pending.initiator == user || &pending.responder == user)
            })
            .cloned()
            .collect())
    }

    async fn accept_key_exchange(
        &self,
        conversation: &ConversationId,
        initiator: &UserId,
        responder: &UserId,
    ) -> Result<(), Self::Error> {
        self.check_online().await?;
        self.inner.write().await.exchanges.retain(|pending| {
            !(&pending.conversation == conversation
                && &pending.initiator == initiator
                && &pending.responder == responder)
        });
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryDirectoryError {
    #[error("directory is offline")]
    Offline,
}
