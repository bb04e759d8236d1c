//! Per-tenant encrypted stores with external blob storage
//!
//! A [`LifecycleManager`] maps tenants to SQLite databases under one storage
//! root, keeps at most one open [`StoreHandle`] per database and deletes a
//! tenant's database together with its external blobs. [`BlobStore`] keeps
//! oversized values as encrypted files next to the database, and
//! [`KeyRotationService`] re-encrypts both under a new key.
//!
//! Blobs are always encrypted. Database files are encrypted only when built
//! with the `sqlcipher` feature; without it, rekeying a database fails with
//! [`StoreError::Encryption`].

pub mod blob_store;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
mod fs_util;
pub mod handle;
pub mod lifecycle;
pub mod logging;
pub mod naming;
pub mod registry;
pub mod rekey;
pub mod telemetry;

pub use blob_store::BlobStore;
pub use config::SoupstoreConfig;
pub use crypto::{AesGcmCipher, Cipher, EncryptionKey};
pub use errors::{BulkOutcome, ItemFailure, StoreError, StoreResult};
pub use handle::StoreHandle;
pub use lifecycle::LifecycleManager;
pub use logging::{init_logging, LogLevel};
pub use naming::{AccountIdentity, StorageLayout, StoreName, TenantKey, UserAccount};
pub use registry::StoreRegistry;
pub use rekey::KeyRotationService;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = TenantKey::global(naming::DEFAULT_DB_NAME);
    }
}
