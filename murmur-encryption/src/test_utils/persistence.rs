// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use murmur_core::{ConversationId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::channel_key::MembershipRecord;
use crate::sealed::{BlobKey, SealedBlob};
use crate::traits::Persistence;

type Records = HashMap<(ConversationId, UserId), MembershipRecord>;

/// Persistence service keeping everything in memory, clones share the same storage.
///
/// Blobs are private to a client while membership records live on the shared server side, see
/// [`MemoryPersistence::share_records`]. Every request yields to the runtime first, so concurrent
/// operations interleave like they would against a remote service.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersistence {
    blobs: Arc<RwLock<HashMap<BlobKey, SealedBlob>>>,
    records: Arc<RwLock<Records>>,
    read_only: Arc<RwLock<bool>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns storage for another client, with its own blobs but the same membership records.
    pub fn share_records(&self) -> Self {
        Self {
            blobs: Arc::default(),
            records: self.records.clone(),
            read_only: Arc::default(),
        }
    }

    /// Lets every following write fail until the service accepts writes again.
    pub async fn set_read_only(&self, read_only: bool) {
        *self.read_only.write().await = read_only;
    }

    async fn check_writable(&self) -> Result<(), MemoryPersistenceError> {
        tokio::task::yield_now().await;
        if *self.read_only.read().await {
            return Err(MemoryPersistenceError::ReadOnly);
        }
        Ok(())
    }

    /// Returns the raw sealed blob, for tests tampering with stored state.
    pub async fn blob(&self, key: &BlobKey) -> Option<SealedBlob> {
        self.blobs.read().await.get(key).cloned()
    }

    pub async fn insert_blob(&self, key: BlobKey, blob: SealedBlob) {
        self.blobs.write().await.insert(key, blob);
    }
}

impl Persistence for MemoryPersistence {
    type Error = MemoryPersistenceError;

    async fn store_blob(&self, key: &BlobKey, blob: &SealedBlob) -> Result<(), Self::Error> {
        self.check_writable().await?;
        self.blobs.write().await.insert(key.clone(), blob.clone());
        Ok(())
    }

    async fn load_blob(&self, key: &BlobKey) -> Result<Option<SealedBlob>, Self::Error> {
        tokio::task::yield_now().await;
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn remove_blob(&self, key: &BlobKey) -> Result<(), Self::Error> {
        self.check_writable().await?;
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn store_membership_record(&self, record: &MembershipRecord) -> Result<(), Self::Error> {
        self.check_writable().await?;
        self.records.write().await.insert(
            (record.channel.clone(), record.member.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn membership_record(
        &self,
        channel: &ConversationId,
        member: &UserId,
    ) -> Result<Option<MembershipRecord>, Self::Error> {
        tokio::task::yield_now().await;
        Ok(self
            .records
            .read()
            .await
            .get(&(channel.clone(), member.clone()))
            .cloned())
    }
}

#[derive(Debug, Error)]
pub enum MemoryPersistenceError {
    #[error("persistence service does not accept writes")]
    ReadOnly,
}
