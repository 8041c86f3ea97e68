// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default lifetime of a signed prekey.
const DEFAULT_LIFETIME_SECS: u64 = 60 * 60 * 24 * 90; // 90 days

/// Current UNIX timestamp in seconds.
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

/// Time window in which a signed prekey may be used, as UNIX timestamps in seconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lifetime {
    not_before: u64,
    not_after: u64,
}

impl Lifetime {
    /// Lifetime starting now and ending after the given number of seconds.
    pub fn new(duration_secs: u64) -> Self {
        let now = now();
        Self {
            not_before: now,
            not_after: now.saturating_add(duration_secs),
        }
    }

    pub fn from_range(not_before: u64, not_after: u64) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    pub fn not_after(&self) -> u64 {
        self.not_after
    }

    pub fn verify(&self) -> Result<(), LifetimeError> {
        self.verify_at(now())
    }

    pub fn verify_at(&self, timestamp: u64) -> Result<(), LifetimeError> {
        if timestamp < self.not_before {
            return Err(LifetimeError::TooEarly(self.not_before, timestamp));
        }

        if timestamp > self.not_after {
            return Err(LifetimeError::Expired(self.not_after, timestamp));
        }

        Ok(())
    }

    /// Big-endian encoding of both bounds, used when signing a prekey.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.not_before.to_be_bytes());
        bytes[8..].copy_from_slice(&self.not_after.to_be_bytes());
        bytes
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new(DEFAULT_LIFETIME_SECS)
    }
}

#[derive(Debug, Error)]
pub enum LifetimeError {
    #[error("lifetime starts at {0} and is not valid yet at {1}")]
    TooEarly(u64, u64),

    #[error("lifetime ended at {0} and is expired at {1}")]
    Expired(u64, u64),
}

#[cfg(test)]
mod tests {
    use super::{Lifetime, LifetimeError, now};

    #[test]
    fn verify() {
        assert!(Lifetime::default().verify().is_ok());
        assert!(Lifetime::new(60).verify().is_ok());

        assert!(matches!(
            Lifetime::from_range(0, 0).verify(),
            Err(LifetimeError::Expired(0, _))
        ));

        let in_an_hour = now() + 60 * 60;
        assert!(matches!(
            Lifetime::from_range(in_an_hour, in_an_hour + 60).verify(),
            Err(LifetimeError::TooEarly(_, _))
        ));
    }

    #[test]
    fn bounds_are_inclusive() {
        let lifetime = Lifetime::from_range(100, 200);
        assert!(lifetime.verify_at(100).is_ok());
        assert!(lifetime.verify_at(200).is_ok());
        assert!(lifetime.verify_at(99).is_err());
        assert!(lifetime.verify_at(201).is_err());
    }
}
