// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory directory and persistence service for tests.
mod directory;
mod persistence;

use murmur_core::UserId;

use crate::config::Config;
use crate::crypto::Crypto;
use crate::manager::Manager;
use crate::sealed::DeviceKey;

pub use directory::{MemoryDirectory, MemoryDirectoryError};
pub use persistence::{MemoryPersistence, MemoryPersistenceError};

pub type TestManager = Manager<MemoryDirectory, MemoryPersistence, Crypto>;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Device key derived from the seed, so a test can "restart" a client with the same key.
pub fn test_device_key(seed: u8) -> DeviceKey {
    DeviceKey::from_bytes([seed; 32])
}

/// Starts a client on a fresh persistence service and publishes its prekeys on the shared
/// directory.
pub async fn test_manager(name: &str, seed: u8, directory: &MemoryDirectory) -> TestManager {
    test_manager_with(name, seed, seed, directory, MemoryPersistence::default()).await
}

/// Starts a client on the given persistence service.
///
/// Restarting a client needs a different `engine_seed`, otherwise it would generate the same keys
/// as its previous instance.
pub async fn test_manager_with(
    name: &str,
    device_seed: u8,
    engine_seed: u8,
    directory: &MemoryDirectory,
    persistence: MemoryPersistence,
) -> TestManager {
    let manager = Manager::init(
        UserId::new(name).unwrap(),
        test_config(),
        directory.clone(),
        persistence,
        test_device_key(device_seed),
        Crypto::from_seed([engine_seed; 32]),
    )
    .await
    .unwrap();
    manager.publish_prekeys().await.unwrap();
    manager
}

pub fn test_config() -> Config {
    Config {
        onetime_prekey_target: 4,
        ..Config::default()
    }
}
