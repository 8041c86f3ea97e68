// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared data-types for the murmur chat crates.
//!
//! Every layer of the client talks about the same handful of things: users, conversations and
//! individual messages. This crate defines their identifiers and the [CBOR] helpers used whenever
//! one of the higher layers needs a canonical byte representation of a value, for example to bind
//! it as associated data in an encryption.
//!
//! [CBOR]: https://cbor.io/
pub mod cbor;
mod identifier;

pub use cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
pub use identifier::{ConversationId, IdentifierError, MessageId, UserId};
