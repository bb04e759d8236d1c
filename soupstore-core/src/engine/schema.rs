//! Schema lifecycle: configure, create, upgrade
//!
//! [`prepare_schema`] is the state machine run on every fresh connection:
//!
//! ```text
//! configure ──► version == 0 ──► on_create ──────────► stamp CURRENT
//!           ├─► version <  CURRENT ──► on_upgrade ───► stamp CURRENT
//!           ├─► version == CURRENT ──► nothing
//!           └─► version >  CURRENT ──► left alone (never downgrade)
//! ```

use super::StoreConnection;
use crate::errors::{StoreError, StoreResult};
use tracing::{info, warn};

/// Schema version this build writes
///
/// 1: soup names and index map
/// 2: long operations status table
/// 3: soup attributes replace soup names
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Callbacks driven by the lifecycle manager when a connection is opened
pub trait SchemaHooks: Send + Sync {
    /// Runs on every open, before the version check
    fn on_configure(&self, conn: &mut dyn StoreConnection) -> StoreResult<()>;

    /// Runs once, when the database file has no schema yet
    fn on_create(&self, conn: &mut dyn StoreConnection) -> StoreResult<()>;

    /// Runs when the file's version is older than the running one
    fn on_upgrade(&self, conn: &mut dyn StoreConnection, from: u32, to: u32) -> StoreResult<()>;
}

/// Migration descriptor
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Soup names and index map",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS soup_names (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    soupName TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS soup_index_map (
                    soupName TEXT NOT NULL,
                    path TEXT NOT NULL,
                    columnName TEXT NOT NULL,
                    columnType TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS soup_index_map_0 ON soup_index_map (soupName);
            "#,
        },
        Migration {
            version: 2,
            description: "Long operations status",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS long_operations_status (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    type TEXT NOT NULL,
                    details TEXT,
                    status TEXT NOT NULL,
                    created INTEGER NOT NULL,
                    lastModified INTEGER NOT NULL
                );
            "#,
        },
        Migration {
            version: 3,
            description: "Soup attributes replace soup names",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS soup_attrs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    soupName TEXT NOT NULL UNIQUE,
                    externalStorage INTEGER NOT NULL DEFAULT 0
                );

                INSERT OR IGNORE INTO soup_attrs (soupName)
                    SELECT soupName FROM soup_names;

                DROP TABLE IF EXISTS soup_names;
            "#,
        },
    ]
}

/// Default hooks: optional write-ahead logging plus the store's meta tables
#[derive(Debug, Clone)]
pub struct MetaTablesSchema {
    wal: bool,
}

impl MetaTablesSchema {
    pub fn new(wal: bool) -> Self {
        Self { wal }
    }

    fn apply(conn: &mut dyn StoreConnection, from: u32, to: u32) -> StoreResult<()> {
        for migration in migrations()
            .into_iter()
            .filter(|m| m.version > from && m.version <= to)
        {
            let sql = format!("BEGIN;\n{}\nCOMMIT;", migration.up_sql);
            if let Err(e) = conn.execute_batch(&sql) {
                // Leave the connection usable for whoever handles the error
                let _ = conn.execute_batch("ROLLBACK;");
                return Err(e);
            }
            info!(
                path = %conn.path().display(),
                version = migration.version,
                description = migration.description,
                "Applied schema migration"
            );
        }
        Ok(())
    }
}

impl Default for MetaTablesSchema {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SchemaHooks for MetaTablesSchema {
    fn on_configure(&self, conn: &mut dyn StoreConnection) -> StoreResult<()> {
        if self.wal {
            conn.enable_write_ahead_logging()?;
        }
        Ok(())
    }

    fn on_create(&self, conn: &mut dyn StoreConnection) -> StoreResult<()> {
        Self::apply(conn, 0, CURRENT_SCHEMA_VERSION)
    }

    fn on_upgrade(&self, conn: &mut dyn StoreConnection, from: u32, to: u32) -> StoreResult<()> {
        Self::apply(conn, from, to)
    }
}

/// Run the configure/create/upgrade sequence; returns the resulting version
pub(crate) fn prepare_schema(
    conn: &mut dyn StoreConnection,
    hooks: &dyn SchemaHooks,
    target: u32,
) -> StoreResult<u32> {
    hooks.on_configure(conn)?;

    let current = conn.schema_version()?;
    let schema_error = |reason: StoreError| StoreError::SchemaUpgrade {
        from: current,
        to: target,
        reason: reason.to_string(),
    };

    if current == 0 {
        hooks.on_create(conn).map_err(schema_error)?;
    } else if current < target {
        hooks.on_upgrade(conn, current, target).map_err(schema_error)?;
    } else {
        if current > target {
            warn!(
                path = %conn.path().display(),
                on_disk = current,
                running = target,
                "Database schema is newer than this build; leaving it untouched"
            );
        }
        return Ok(current);
    }

    conn.set_schema_version(target).map_err(schema_error)?;
    Ok(target)
}
