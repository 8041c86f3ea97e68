// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces of the services this layer depends on.
//!
//! The directory and the persistence service are both untrusted: everything secret handed to them
//! is either sealed under the device key or wrapped for a single recipient.
mod directory;
mod persistence;

pub use directory::Directory;
pub use persistence::Persistence;
