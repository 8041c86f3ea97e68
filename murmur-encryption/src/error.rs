// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Failure categories every error of this crate maps into.
///
/// Callers use the category to decide what to do next: verification failures are never retried,
/// missing keys heal once the key material arrives, exhaustion is handled by falling back to a
/// weaker handshake and transport failures can be retried by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Signature or authentication tag mismatch.
    Verification,

    /// No session, sender chain, channel key or message key available (yet).
    MissingKey,

    /// No one-time prekeys left.
    Exhaustion,

    /// The directory or persistence service failed.
    Transport,

    /// Malformed input, encoding failures or broken local state.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ErrorKind::Verification => "verification",
            ErrorKind::MissingKey => "missing key",
            ErrorKind::Exhaustion => "exhaustion",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{value}")
    }
}
