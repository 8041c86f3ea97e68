// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use murmur_core::{ConversationId, UserId};

use crate::channel_key::MembershipRecord;
use crate::sealed::{BlobKey, SealedBlob};

/// Untrusted storage for sealed local state and channel membership records.
pub trait Persistence {
    type Error: Error;

    fn store_blob(
        &self,
        key: &BlobKey,
        blob: &SealedBlob,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn load_blob(
        &self,
        key: &BlobKey,
    ) -> impl Future<Output = Result<Option<SealedBlob>, Self::Error>>;

    fn remove_blob(&self, key: &BlobKey) -> impl Future<Output = Result<(), Self::Error>>;

    /// Stores the channel key wrapped for one member of the channel.
    fn store_membership_record(
        &self,
        record: &MembershipRecord,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn membership_record(
        &self,
        channel: &ConversationId,
        member: &UserId,
    ) -> impl Future<Output = Result<Option<MembershipRecord>, Self::Error>>;
}
