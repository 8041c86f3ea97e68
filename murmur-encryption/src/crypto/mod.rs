// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives and the engine facade the protocols talk to.
//!
//! Following algorithms are used:
//! * ChaCha random number generator with 20 rounds
//! * XChaCha20-Poly1305 AEAD
//! * HPKE with DHKEM-X25519, HKDF SHA256 and ChaCha20-Poly1305 AEAD
//! * HKDF with SHA256
//! * SHA2-256 and SHA2-512 hashing functions
//! * EdDSA related to Curve25519 with SHA-512
//! * ECDH key agreement with X25519
mod engine;
pub mod ed25519;
pub mod hkdf;
pub mod hpke;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xchacha20;

pub use engine::{
    AeadCiphertext, Crypto, CryptoEngine, CryptoError, SYMMETRIC_KEY_SIZE, SymmetricKey,
};
pub use rng::{Rng, RngError};
pub use secret::Secret;
