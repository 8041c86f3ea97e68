// SPDX-License-Identifier: MIT OR Apache-2.0

//! `murmur-encryption` is the client-side key management and encryption layer of the murmur chat
//! application.
//!
//! It sits between the application and two untrusted services: a directory holding public key
//! material and pending key exchanges, and a persistence service holding our sealed local state.
//! Neither of them ever sees a secret key or a plaintext.
//!
//! ## Conversations
//!
//! Three kinds of conversations are supported, each with its own encryption scheme:
//!
//! * **Direct messages** between two users use an X3DH handshake against the peer's published
//!   prekeys, followed by the [Double
//!   Ratchet](https://signal.org/docs/specifications/doubleratchet). Every message is encrypted
//!   with its own key, compromising a key does not reveal earlier messages.
//! * **Groups** use sender keys: every member owns a symmetric chain and hands it to every other
//!   member, wrapped for their identity key with HPKE. A member joining later only receives the
//!   chains at their current position and can not read history.
//! * **Server channels** use one symmetric channel key shared by all members. The key is wrapped
//!   once per member and stored as membership record, new members can read the full history.
//!
//! Additionally every conversation can carry a conversation key protecting its metadata, like name
//! and icon.
//!
//! ## Usage
//!
//! Applications interact with a [`Manager`], constructed with implementations of the
//! [`Directory`](traits::Directory) and [`Persistence`](traits::Persistence) interfaces and a
//! [`DeviceKey`] kept in the platform's secure storage:
//!
//! * [`Manager::ensure_session`] establishes a direct session, or reports it as degraded when the
//!   peer's prekeys can not be used.
//! * [`Manager::encrypt_for_send`] and [`Manager::decrypt_received`] handle message bodies of all
//!   conversation kinds.
//! * [`Manager::on_membership_changed`] shares our keys with new members of a group or channel.
//! * [`Manager::safety_fingerprint`] returns the number both users compare to verify each other's
//!   identity.
//!
//! ## Security
//!
//! Edits of earlier messages are encrypted with a fresh key wrapped for every recipient's identity
//! key, they are _not_ forward secret. Removing a member from a group or channel does not replace
//! any key, the removed member can keep deriving keys it received before.
pub mod channel_key;
mod chain;
pub mod config;
pub mod conversation_key;
pub mod crypto;
pub mod edit;
pub mod envelope;
mod error;
pub mod fingerprint;
mod identity;
pub mod key_bundle;
mod key_manager;
mod key_store;
mod manager;
mod sealed;
pub mod sender_key;
pub mod session;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;

pub use config::Config;
pub use envelope::{DirectMessage, Envelope, MembershipChange, Outbound, Plaintext, TransportEvent};
pub use error::ErrorKind;
pub use identity::{IdentityKey, IdentityKeyPair};
pub use key_manager::{KeyManager, KeyManagerError, KeyManagerState};
pub use key_store::{KeyStore, KeyStoreError};
pub use manager::{
    ConversationKind, DegradedReason, EventOutcome, Manager, ManagerError, SessionStatus,
};
pub use sealed::{BlobKey, DeviceKey, SealError, SealedBlob};
