// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use murmur_core::{ConversationId, UserId};

use crate::identity::IdentityKey;
use crate::key_bundle::{PrekeyBundle, PublishedPrekeys};
use crate::session::PendingKeyExchange;

/// Server-side directory of public key material and pending key exchanges.
pub trait Directory {
    type Error: Error;

    /// Replaces the signed prekey of the user and adds the given one-time prekeys to their pool.
    fn publish_prekeys(
        &self,
        user: &UserId,
        prekeys: &PublishedPrekeys,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns a prekey bundle of the user.
    ///
    /// At most one one-time prekey is attached and removed from the pool, so no two callers ever
    /// receive the same one. Returns a bundle without one-time prekey when the pool is empty.
    fn fetch_prekey_bundle(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Option<PrekeyBundle>, Self::Error>>;

    fn identity_key(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Option<IdentityKey>, Self::Error>>;

    /// Stores a key exchange, replacing an outstanding one for the same conversation, initiator
    /// and responder.
    fn publish_key_exchange(
        &self,
        exchange: &PendingKeyExchange,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns all outstanding key exchanges of a conversation the user is part of, either as
    /// initiator or as responder.
    fn key_exchanges(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<PendingKeyExchange>, Self::Error>>;

    /// Marks a key exchange as accepted, removing it from the directory.
    fn accept_key_exchange(
        &self,
        conversation: &ConversationId,
        initiator: &UserId,
        responder: &UserId,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
