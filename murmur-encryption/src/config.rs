// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key_bundle::Lifetime;

/// Configuration for a key management and encryption instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// When a signed prekey should be considered expired and thus invalid.
    pub prekey_lifetime: Duration,

    /// Rotate our own signed prekey after this duration, to allow some time between peers
    /// receiving our new one and the old one expiring.
    pub prekey_rotate_after: Duration,

    /// Number of unused one-time prekeys we try to keep available on the directory.
    pub onetime_prekey_target: usize,

    /// Maximum number of message keys a single ratchet step may skip over.
    pub max_skip: u32,

    /// Maximum number of skipped message keys retained per session.
    pub max_skipped_keys: usize,

    /// Maximum number of iterations a sender chain may be derived forward at once.
    pub max_sender_key_skip: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prekey_lifetime: Duration::from_secs(60 * 60 * 24 * 90), // 90 days
            prekey_rotate_after: Duration::from_secs(60 * 60 * 24 * 60), // 60 days
            onetime_prekey_target: 100,
            max_skip: 1000,
            max_skipped_keys: 2000,
            max_sender_key_skip: 1000,
        }
    }
}

impl Config {
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.prekey_lifetime.as_secs())
    }

    pub(crate) fn ratchet_limits(&self) -> SkipLimits {
        SkipLimits {
            max_skip: self.max_skip,
            max_skipped_keys: self.max_skipped_keys,
        }
    }

    pub(crate) fn sender_key_limits(&self) -> SkipLimits {
        SkipLimits {
            max_skip: self.max_sender_key_skip,
            max_skipped_keys: self.max_skipped_keys,
        }
    }
}

/// Bounds for deriving and retaining message keys of out-of-order messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SkipLimits {
    pub max_skip: u32,
    pub max_skipped_keys: usize,
}

impl Default for SkipLimits {
    fn default() -> Self {
        Config::default().ratchet_limits()
    }
}
