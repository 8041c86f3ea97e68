// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symmetric key chain shared by the direct-message ratchet and sender chains.
//!
//! Every step derives a single-use message key and the chain key of the next step from the
//! current chain key. The old chain key is dropped, so an attacker who learns a chain key can not
//! go back and decrypt earlier messages.
//!
//! ```text
//! CK_0 ──> CK_1 ──> CK_2 ──> ...
//!  │        │        │
//!  v        v        v
//! MK_0     MK_1     MK_2
//! ```
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoEngine, CryptoError, Secret, SymmetricKey};

pub const CHAIN_KEY_SIZE: usize = 32;

const MESSAGE_KEY_INFO: &[u8] = b"murmur-message-key";

const CHAIN_KEY_INFO: &[u8] = b"murmur-chain-key";

/// Single-use key encrypting exactly one message.
pub type MessageKey = SymmetricKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey(Secret<CHAIN_KEY_SIZE>);

impl ChainKey {
    pub(crate) fn from_bytes(bytes: [u8; CHAIN_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    /// Returns the chain key of the next step and the message key of the current one.
    pub fn step<E: CryptoEngine>(&self, engine: &E) -> Result<(ChainKey, MessageKey), CryptoError> {
        let message_key = engine.derive_key(b"", self.0.as_bytes(), MESSAGE_KEY_INFO)?;
        let next_chain_key = engine.derive_key(b"", self.0.as_bytes(), CHAIN_KEY_INFO)?;
        Ok((
            ChainKey::from_bytes(next_chain_key),
            Secret::from_bytes(message_key),
        ))
    }
}
