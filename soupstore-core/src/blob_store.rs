/*
    blob_store.rs - Encrypted external storage for oversized soup elements

    One file per element at
    <root>/databases/<store>_external_soup_blobs/<table>/soupelt_<id>.

    Blob storage is secondary to the database: IO and crypto failures are
    logged and reported as false / None / failure entries rather than
    errors. Malformed table names are always surfaced.
*/

use crate::crypto::{Cipher, EncryptionKey};
use crate::errors::{BulkOutcome, StoreResult};
use crate::fs_util;
use crate::naming::{validate_table_name, StorageLayout, StoreName};
use metrics::counter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads and writes encrypted blobs for any store under one storage root
#[derive(Clone)]
pub struct BlobStore {
    layout: StorageLayout,
    cipher: Arc<dyn Cipher>,
}

impl BlobStore {
    pub fn new(layout: StorageLayout, cipher: Arc<dyn Cipher>) -> Self {
        Self { layout, cipher }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub(crate) fn cipher(&self) -> &dyn Cipher {
        self.cipher.as_ref()
    }

    /// Deterministic file of one element
    pub fn blob_path(&self, store: &StoreName, table: &str, entry_id: u64) -> StoreResult<PathBuf> {
        self.layout.blob_path(store, table, entry_id)
    }

    /// Blob root of `store`
    pub fn blob_root(&self, store: &StoreName) -> PathBuf {
        self.layout.blob_root(store)
    }

    /// Encrypt `value` with `key` and write it, replacing any previous value.
    ///
    /// Returns `Ok(false)` when the write or the encryption failed.
    pub fn save(
        &self,
        store: &StoreName,
        table: &str,
        entry_id: u64,
        value: &[u8],
        key: &EncryptionKey,
    ) -> StoreResult<bool> {
        let path = self.blob_path(store, table, entry_id)?;

        let result = self.cipher.encrypt(value, key).and_then(|ciphertext| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs_util::write_atomic(&path, &ciphertext)
        });

        match result {
            Ok(()) => {
                debug!(store = %store, table, entry_id, bytes = value.len(), "Saved external blob");
                counter!("blob_store.saves").increment(1);
                Ok(true)
            }
            Err(e) => {
                warn!(store = %store, table, entry_id, error = %e, "Failed to write external blob");
                counter!("blob_store.save_failures").increment(1);
                Ok(false)
            }
        }
    }

    /// Save a soup element given as text (usually serialized JSON)
    pub fn save_str(
        &self,
        store: &StoreName,
        table: &str,
        entry_id: u64,
        value: &str,
        key: &EncryptionKey,
    ) -> StoreResult<bool> {
        self.save(store, table, entry_id, value.as_bytes(), key)
    }

    /// Read and decrypt one element.
    ///
    /// `Ok(None)` covers a missing file as well as an unreadable or
    /// undecryptable one; the latter cases are logged.
    pub fn load(
        &self,
        store: &StoreName,
        table: &str,
        entry_id: u64,
        key: &EncryptionKey,
    ) -> StoreResult<Option<Vec<u8>>> {
        let path = self.blob_path(store, table, entry_id)?;

        let ciphertext = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(store = %store, table, entry_id, error = %e, "Failed to read external blob");
                return Ok(None);
            }
        };

        match self.cipher.decrypt(&ciphertext, key) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(store = %store, table, entry_id, error = %e, "Failed to decrypt external blob");
                counter!("blob_store.decrypt_failures").increment(1);
                Ok(None)
            }
        }
    }

    /// Load an element stored as text. Invalid UTF-8 counts as absent.
    pub fn load_string(
        &self,
        store: &StoreName,
        table: &str,
        entry_id: u64,
        key: &EncryptionKey,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .load(store, table, entry_id, key)?
            .and_then(|bytes| match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(store = %store, table, entry_id, error = %e, "External blob is not UTF-8");
                    None
                }
            }))
    }

    /// Delete the given elements. Every id is attempted; a missing file
    /// counts as a failure.
    pub fn delete(&self, store: &StoreName, table: &str, entry_ids: &[u64]) -> StoreResult<BulkOutcome> {
        validate_table_name(table)?;

        let mut outcome = BulkOutcome::new();
        for &entry_id in entry_ids {
            let path = self.blob_path(store, table, entry_id)?;
            match fs::remove_file(&path) {
                Ok(()) => outcome.record_success(),
                Err(e) => {
                    warn!(store = %store, table, entry_id, error = %e, "Failed to delete external blob");
                    outcome.record_failure(&path, e.into());
                }
            }
        }
        Ok(outcome)
    }

    /// Total bytes stored for `store`, or for one of its tables
    pub fn size_of(&self, store: &StoreName, table: Option<&str>) -> StoreResult<u64> {
        let dir = match table {
            Some(table) => self.layout.table_dir(store, table)?,
            None => self.layout.blob_root(store),
        };
        Ok(fs_util::dir_size(&dir))
    }

    /// Create the blob folder of one table. Returns false if it already existed.
    pub fn create_table_dir(&self, store: &StoreName, table: &str) -> StoreResult<bool> {
        let dir = self.layout.table_dir(store, table)?;
        if dir.is_dir() {
            return Ok(false);
        }
        match fs::create_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(store = %store, table, error = %e, "Failed to create external blob folder");
                Ok(false)
            }
        }
    }

    /// Remove the blob folder of one table and everything in it
    pub fn remove_table_dir(&self, store: &StoreName, table: &str) -> StoreResult<BulkOutcome> {
        let dir = self.layout.table_dir(store, table)?;
        Ok(self.remove_all(&dir))
    }

    /// Remove the whole blob root of `store`
    pub fn remove_store_blobs(&self, store: &StoreName) -> BulkOutcome {
        self.remove_all(&self.layout.blob_root(store))
    }

    /// Recursively delete `dir` and its contents.
    ///
    /// Not successful when `dir` did not exist; otherwise the AND of every
    /// individual delete.
    pub fn remove_all(&self, dir: &Path) -> BulkOutcome {
        let outcome = fs_util::remove_tree(dir);
        for failure in &outcome.failures {
            warn!(path = %failure.path.display(), error = %failure.error, "Failed to remove blob path");
        }
        outcome
    }
}
