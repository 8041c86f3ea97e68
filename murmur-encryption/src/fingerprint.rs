// SPDX-License-Identifier: MIT OR Apache-2.0

//! Numeric safety fingerprints users compare out-of-band to verify each other's identity.
//!
//! Each identity is hashed into 30 decimal digits. Both halves are sorted before they are joined,
//! so both users see the same 60 digits on their screens, rendered as 12 groups of five.
use crate::crypto::sha2::sha2_512;
use crate::identity::IdentityKey;

const VERSION: [u8; 2] = [0, 1];

const ITERATIONS: usize = 5200;

/// Digits derived from a single identity.
fn identity_digits(identity: &IdentityKey) -> String {
    let identity_bytes = identity.to_bytes();

    let mut digest = sha2_512(&[&VERSION[..], &identity_bytes[..]]);
    for _ in 1..ITERATIONS {
        digest = sha2_512(&[&digest[..], &identity_bytes[..]]);
    }

    digest[..30]
        .chunks_exact(5)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            format!("{:05}", value % 100_000)
        })
        .collect()
}

/// Returns the safety fingerprint of two identities, independent of their order.
pub fn safety_fingerprint(our_identity: &IdentityKey, their_identity: &IdentityKey) -> String {
    let mut halves = [
        identity_digits(our_identity),
        identity_digits(their_identity),
    ];
    halves.sort();
    let digits = halves.concat();

    digits
        .as_bytes()
        .chunks(5)
        .map(|group| String::from_utf8_lossy(group).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
