//! Key rotation for a store's database and its external blobs
//!
//! Blob rotation is sequential and best effort. Each blob is rewritten
//! through a temp file and a rename, so an interrupted run leaves every blob
//! readable under either the old or the new key. Running it again with the
//! same keys finishes the job: blobs that already open with the new key are
//! counted as rotated.

use crate::blob_store::BlobStore;
use crate::crypto::EncryptionKey;
use crate::errors::{BulkOutcome, StoreResult};
use crate::fs_util;
use crate::handle::StoreHandle;
use crate::naming::{StoreName, SOUP_ELEMENT_PREFIX};
use metrics::counter;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Re-encrypts stores under a new key
#[derive(Clone)]
pub struct KeyRotationService {
    blobs: BlobStore,
}

impl KeyRotationService {
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    /// Change the key of the open database behind `handle`.
    ///
    /// The connection is already keyed, so only the new key is needed.
    pub fn rotate_database_key(&self, handle: &StoreHandle, new_key: &EncryptionKey) -> StoreResult<()> {
        handle.with_connection(|conn| conn.change_key(new_key))?;
        info!(store = %handle.name(), "Rotated database key");
        Ok(())
    }

    /// Re-encrypt every blob of `store` from `old_key` to `new_key`.
    ///
    /// A store without a blob root has nothing to rotate and succeeds.
    pub fn rotate_blob_keys(
        &self,
        store: &StoreName,
        old_key: &EncryptionKey,
        new_key: &EncryptionKey,
    ) -> BulkOutcome {
        let root = self.blobs.blob_root(store);
        let mut outcome = BulkOutcome::new();
        if !root.is_dir() {
            debug!(store = %store, "No external blobs to rotate");
            return outcome;
        }

        let tables = match fs_util::list_dirs(&root) {
            Ok(tables) => tables,
            Err(e) => {
                warn!(store = %store, error = %e, "Failed to list blob tables");
                outcome.record_failure(&root, e.into());
                return outcome;
            }
        };

        for table_dir in tables {
            let blobs = fs_util::list_files(&table_dir, |file| file.starts_with(SOUP_ELEMENT_PREFIX));
            let blobs = match blobs {
                Ok(blobs) => blobs,
                Err(e) => {
                    warn!(dir = %table_dir.display(), error = %e, "Failed to list blobs");
                    outcome.record_failure(&table_dir, e.into());
                    continue;
                }
            };

            // Leftovers of an interrupted write are not blobs
            for path in blobs.into_iter().filter(|p| !fs_util::is_temp_file(p)) {
                match self.rotate_blob(&path, old_key, new_key) {
                    Ok(()) => outcome.record_success(),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to rotate blob");
                        counter!("rekey.blob_failures").increment(1);
                        outcome.record_failure(&path, e);
                    }
                }
            }
        }

        info!(
            store = %store,
            blobs = outcome.processed,
            failures = outcome.failures.len(),
            "Rotated blob keys"
        );
        outcome
    }

    /// Rotate the database key, then every blob of the store.
    ///
    /// An engine without encryption fails the first step, and no blob is
    /// touched.
    pub fn rotate_key(
        &self,
        handle: &StoreHandle,
        old_key: &EncryptionKey,
        new_key: &EncryptionKey,
    ) -> StoreResult<BulkOutcome> {
        self.rotate_database_key(handle, new_key)?;
        Ok(self.rotate_blob_keys(handle.name(), old_key, new_key))
    }

    fn rotate_blob(&self, path: &Path, old_key: &EncryptionKey, new_key: &EncryptionKey) -> StoreResult<()> {
        let cipher = self.blobs.cipher();
        let ciphertext = fs::read(path)?;

        let plaintext = match cipher.decrypt(&ciphertext, old_key) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(e) => {
                // Rotated by an earlier, interrupted run
                if cipher.decrypt(&ciphertext, new_key).is_ok() {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let rotated = cipher.encrypt(&plaintext, new_key)?;
        fs_util::write_atomic(path, &rotated)?;
        counter!("rekey.blobs_rotated").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoConfig;
    use crate::crypto::AesGcmCipher;
    use crate::naming::{derive_store_name, StorageLayout};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn blob_store(dir: &TempDir) -> BlobStore {
        let cipher = AesGcmCipher::new(&CryptoConfig::for_tests()).unwrap();
        BlobStore::new(StorageLayout::new(dir.path()), Arc::new(cipher))
    }

    #[test]
    fn test_rotate_blob_keys() {
        let dir = TempDir::new().unwrap();
        let blobs = blob_store(&dir);
        let service = KeyRotationService::new(blobs.clone());
        let name = derive_store_name("smartstore", None).unwrap();
        let k1 = EncryptionKey::new("k1");
        let k2 = EncryptionKey::new("k2");

        blobs.save(&name, "tbl", 42, b"hello", &k1).unwrap();
        blobs.save(&name, "other", 7, b"world", &k1).unwrap();

        let outcome = service.rotate_blob_keys(&name, &k1, &k2);
        assert!(outcome.succeeded());
        assert_eq!(outcome.processed, 2);

        assert_eq!(blobs.load(&name, "tbl", 42, &k2).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(blobs.load(&name, "other", 7, &k2).unwrap(), Some(b"world".to_vec()));
        assert_eq!(blobs.load(&name, "tbl", 42, &k1).unwrap(), None);
    }

    #[test]
    fn test_missing_root_is_noop_success() {
        let dir = TempDir::new().unwrap();
        let service = KeyRotationService::new(blob_store(&dir));
        let name = derive_store_name("empty", None).unwrap();

        let outcome = service.rotate_blob_keys(&name, &EncryptionKey::new("a"), &EncryptionKey::new("b"));
        assert!(outcome.succeeded());
        assert_eq!(outcome.processed, 0);
    }

    #[test]
    fn test_rerun_after_partial_rotation() {
        let dir = TempDir::new().unwrap();
        let blobs = blob_store(&dir);
        let service = KeyRotationService::new(blobs.clone());
        let name = derive_store_name("smartstore", None).unwrap();
        let k1 = EncryptionKey::new("k1");
        let k2 = EncryptionKey::new("k2");

        // One blob already under the new key, one still under the old
        blobs.save(&name, "tbl", 1, b"done", &k2).unwrap();
        blobs.save(&name, "tbl", 2, b"pending", &k1).unwrap();

        let outcome = service.rotate_blob_keys(&name, &k1, &k2);
        assert!(outcome.succeeded());
        assert_eq!(blobs.load(&name, "tbl", 1, &k2).unwrap(), Some(b"done".to_vec()));
        assert_eq!(blobs.load(&name, "tbl", 2, &k2).unwrap(), Some(b"pending".to_vec()));
    }

    #[test]
    fn test_unreadable_blob_does_not_stop_rotation() {
        let dir = TempDir::new().unwrap();
        let blobs = blob_store(&dir);
        let service = KeyRotationService::new(blobs.clone());
        let name = derive_store_name("smartstore", None).unwrap();
        let k1 = EncryptionKey::new("k1");
        let k2 = EncryptionKey::new("k2");

        blobs.save(&name, "tbl", 1, b"a", &k1).unwrap();
        blobs.save(&name, "tbl", 2, b"b", &k1).unwrap();
        let corrupt = blobs.blob_path(&name, "tbl", 1).unwrap();
        fs::write(&corrupt, b"garbage").unwrap();

        let outcome = service.rotate_blob_keys(&name, &k1, &k2);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, corrupt);

        // Untouched, not deleted
        assert_eq!(fs::read(&corrupt).unwrap(), b"garbage");
        assert_eq!(blobs.load(&name, "tbl", 2, &k2).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_temp_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let blobs = blob_store(&dir);
        let service = KeyRotationService::new(blobs.clone());
        let name = derive_store_name("smartstore", None).unwrap();
        let k1 = EncryptionKey::new("k1");

        blobs.save(&name, "tbl", 1, b"a", &k1).unwrap();
        let table_dir = blobs.layout().table_dir(&name, "tbl").unwrap();
        fs::write(table_dir.join(".soupelt_1.Xy12ab.tmp"), b"partial").unwrap();
        fs::write(table_dir.join("soupelt_2.tmp"), b"partial").unwrap();

        let outcome = service.rotate_blob_keys(&name, &k1, &EncryptionKey::new("k2"));
        assert!(outcome.succeeded());
        assert_eq!(outcome.processed, 1);
    }
}
