//! Live store handle

use crate::engine::StoreConnection;
use crate::errors::{handle_poison, StoreError, StoreResult};
use crate::naming::StoreName;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// One open database plus the locations derived from its name.
///
/// The connection is opened without engine-level locking; this mutex is the
/// only thing serializing access to it.
pub struct StoreHandle {
    name: StoreName,
    db_path: PathBuf,
    blob_root: PathBuf,
    schema_version: u32,
    connection: Mutex<Option<Box<dyn StoreConnection>>>,
}

impl StoreHandle {
    pub(crate) fn new(
        name: StoreName,
        db_path: PathBuf,
        blob_root: PathBuf,
        schema_version: u32,
        connection: Box<dyn StoreConnection>,
    ) -> Self {
        Self {
            name,
            db_path,
            blob_root,
            schema_version,
            connection: Mutex::new(Some(connection)),
        }
    }

    pub fn name(&self) -> &StoreName {
        &self.name
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn blob_root(&self) -> &Path {
        &self.blob_root
    }

    /// Schema version found or written when the handle was opened
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn StoreConnection) -> StoreResult<R>,
    {
        let mut guard = self.connection.lock().map_err(handle_poison)?;
        match guard.as_mut() {
            Some(conn) => f(conn.as_mut()),
            None => Err(StoreError::Closed(self.name.to_string())),
        }
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) -> StoreResult<()> {
        let conn = self.connection.lock().map_err(handle_poison)?.take();
        match conn {
            Some(conn) => {
                debug!(store = %self.name, "Closing store");
                conn.close()
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.connection.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("db_path", &self.db_path)
            .field("schema_version", &self.schema_version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::engine::{DatabaseEngine, OpenOptions, SqliteEngine};
    use crate::naming::{derive_store_name, StorageLayout};
    use tempfile::TempDir;

    fn handle(dir: &TempDir) -> StoreHandle {
        let layout = StorageLayout::new(dir.path());
        let name = derive_store_name("smartstore", None).unwrap();
        std::fs::create_dir_all(layout.databases_dir()).unwrap();
        let db_path = layout.database_path(&name);
        let conn = SqliteEngine::default()
            .open(&db_path, &EncryptionKey::new("k"), OpenOptions::default())
            .unwrap();
        StoreHandle::new(name.clone(), db_path, layout.blob_root(&name), 0, conn)
    }

    #[test]
    fn test_with_connection() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir);

        handle
            .with_connection(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER);"))
            .unwrap();
        let version = handle.with_connection(|conn| conn.schema_version()).unwrap();
        assert_eq!(version, 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let handle = handle(&dir);

        assert!(!handle.is_closed());
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(handle.is_closed());

        let result = handle.with_connection(|conn| conn.schema_version());
        assert!(matches!(result, Err(StoreError::Closed(_))));
    }
}
