// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-based key derivation function (HKDF) with SHA256.
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Derives `N` bytes of output key material from the input key material.
///
/// An empty salt is treated as "no salt", HKDF then falls back to a string of zeroes.
pub fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N], HkdfError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidArguments)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested output length too large for hkdf")]
    InvalidArguments,
}

#[cfg(test)]
mod tests {
    use super::{HkdfError, hkdf};

    #[test]
    fn info_needs_to_match() {
        let result_1: [u8; 32] = hkdf(b"salt", b"ikm", b"message").unwrap();
        let result_2: [u8; 32] = hkdf(b"salt", b"ikm", b"message").unwrap();
        let result_3: [u8; 32] = hkdf(b"salt", b"ikm", b"chain").unwrap();
        assert_eq!(result_1, result_2);
        assert_ne!(result_2, result_3);
    }

    #[test]
    fn output_too_large() {
        // SHA256 allows at most 255 * 32 bytes of output.
        let result: Result<[u8; 8161], HkdfError> = hkdf(b"", b"ikm", b"");
        assert!(matches!(result, Err(HkdfError::InvalidArguments)));
    }
}
