// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public key material users publish on the directory so others can start a session with them
//! while they are offline.
mod bundle;
mod lifetime;
mod prekey;

pub use bundle::{KeyBundleError, PrekeyBundle, PublishedPrekeys};
pub use lifetime::{Lifetime, LifetimeError};
pub(crate) use lifetime::now;
pub use prekey::{OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId};
