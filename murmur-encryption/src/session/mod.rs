// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct sessions between two users: X3DH handshake, key exchanges and the Double Ratchet.
mod exchange;
mod ratchet;
mod x3dh;

pub use exchange::{EstablishError, KeyExchange, KeyExchangeOffer, PendingKeyExchange};
pub use ratchet::{
    Ratchet, RatchetCiphertext, RatchetError, RatchetHeader, RatchetStatus, Role, SessionState,
};
pub use x3dh::{SharedSecret, X3dhError, x3dh_initiate, x3dh_respond};
