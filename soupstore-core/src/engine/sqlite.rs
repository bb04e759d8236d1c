//! SQLite-backed database engine
//!
//! Uses the bundled SQLite by default. Built with the `sqlcipher` feature
//! the same code links SQLCipher and the `key`/`rekey` pragmas encrypt the
//! file. The engine asks for `PRAGMA cipher_version` on open: plain SQLite
//! answers with no row, the key is not applied, and [`StoreConnection::change_key`]
//! fails with [`StoreError::Encryption`] instead of silently doing nothing.

use super::{DatabaseEngine, OpenOptions, StoreConnection};
use crate::crypto::EncryptionKey;
use crate::errors::{StoreError, StoreResult};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key derivation iterations of SQLCipher 2.x; newer defaults are too slow
/// on small devices, and this keeps 2.x files readable without migration.
const LEGACY_KDF_ITER: u32 = 4000;

/// Opens SQLite database files
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    sqlcipher_compat: bool,
}

impl SqliteEngine {
    /// `sqlcipher_compat` issues the pragmas that keep databases written by
    /// older SQLCipher releases readable
    pub fn new(sqlcipher_compat: bool) -> Self {
        Self { sqlcipher_compat }
    }
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DatabaseEngine for SqliteEngine {
    fn open(
        &self,
        path: &Path,
        key: &EncryptionKey,
        options: OpenOptions,
    ) -> StoreResult<Box<dyn StoreConnection>> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        flags |= if options.internal_locking {
            OpenFlags::SQLITE_OPEN_FULL_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let conn = Connection::open_with_flags(path, flags)?;

        let cipher_version: Option<String> = conn
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .optional()?;
        let encrypted = cipher_version.is_some();

        if encrypted {
            if self.sqlcipher_compat {
                conn.pragma_update(None, "cipher_default_kdf_iter", LEGACY_KDF_ITER)?;
            }
            conn.pragma_update(None, "key", key.expose())?;
            if self.sqlcipher_compat {
                conn.execute_batch("PRAGMA cipher_migrate;")?;
            }
        } else {
            warn!(path = %path.display(), "SQLite built without encryption; database file is not encrypted");
        }

        // First real read; fails here when the key does not match
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| {
                StoreError::Encryption(format!(
                    "cannot read {} with the supplied key: {}",
                    path.display(),
                    e
                ))
            })?;

        debug!(
            path = %path.display(),
            internal_locking = options.internal_locking,
            cipher = cipher_version.as_deref().unwrap_or("none"),
            "Opened SQLite database"
        );

        Ok(Box::new(SqliteConnection {
            conn,
            path: path.to_path_buf(),
            encrypted,
        }))
    }
}

/// An open SQLite database
pub struct SqliteConnection {
    conn: Connection,
    path: PathBuf,
    encrypted: bool,
}

impl StoreConnection for SqliteConnection {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn schema_version(&self) -> StoreResult<u32> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        u32::try_from(version)
            .map_err(|_| StoreError::Database(format!("invalid user_version {}", version)))
    }

    fn set_schema_version(&mut self, version: u32) -> StoreResult<()> {
        self.conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str) -> StoreResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn enable_write_ahead_logging(&mut self) -> StoreResult<()> {
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            debug!(path = %self.path.display(), mode = %mode, "Write-ahead logging not available");
        }
        Ok(())
    }

    fn change_key(&mut self, new_key: &EncryptionKey) -> StoreResult<()> {
        if !self.encrypted {
            return Err(StoreError::Encryption(
                "database engine has no encryption support".to_string(),
            ));
        }
        // Bound as a value, so quotes in the key cannot break the statement
        self.conn.pragma_update(None, "rekey", new_key.expose())?;
        Ok(())
    }

    fn close(self: Box<Self>) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::from(e))
    }
}
