//! Embedded database engine seam
//!
//! The lifecycle manager never talks to SQLite directly. It opens
//! connections through [`DatabaseEngine`] and drives schema setup through
//! [`SchemaHooks`], so the engine and the schema can be swapped or faked.

pub mod schema;
pub mod sqlite;

pub use schema::{MetaTablesSchema, Migration, SchemaHooks, CURRENT_SCHEMA_VERSION};
pub use sqlite::SqliteEngine;

use crate::crypto::EncryptionKey;
use crate::errors::StoreResult;
use std::path::Path;

/// How a connection should be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Keep the engine's own per-connection locking. The lifecycle manager
    /// always turns this off: every handle serializes access itself.
    pub internal_locking: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            internal_locking: true,
        }
    }
}

/// One open connection to an embedded database file
pub trait StoreConnection: Send {
    /// Path of the database file
    fn path(&self) -> &Path;

    /// Whether the file is encrypted under the key it was opened with
    fn is_encrypted(&self) -> bool;

    /// Schema version recorded in the file (0 for a fresh database)
    fn schema_version(&self) -> StoreResult<u32>;

    fn set_schema_version(&mut self, version: u32) -> StoreResult<()>;

    /// Run one or more statements
    fn execute_batch(&mut self, sql: &str) -> StoreResult<()>;

    fn enable_write_ahead_logging(&mut self) -> StoreResult<()>;

    /// Re-encrypt the whole database under `new_key`; fails with
    /// `StoreError::Encryption` when the engine cannot encrypt
    fn change_key(&mut self, new_key: &EncryptionKey) -> StoreResult<()>;

    /// Flush and close
    fn close(self: Box<Self>) -> StoreResult<()>;
}

/// Opens or creates database files
pub trait DatabaseEngine: Send + Sync {
    fn open(
        &self,
        path: &Path,
        key: &EncryptionKey,
        options: OpenOptions,
    ) -> StoreResult<Box<dyn StoreConnection>>;
}
