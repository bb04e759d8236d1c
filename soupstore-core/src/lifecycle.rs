/*
    lifecycle.rs - Opening, existence checks and deletion of tenant stores

    Deletion is best effort: every step runs even when an earlier one failed,
    and the returned BulkOutcome lists what could not be removed. Only
    malformed names and poisoned locks are surfaced as errors.

    Deleting an account store WITHOUT a community id cascades: every store of
    that account (all communities, under the same name prefix) is deleted
    together with its external blobs. Pass the community id to delete only
    that community's store.
*/

use crate::blob_store::BlobStore;
use crate::config::SoupstoreConfig;
use crate::crypto::{AesGcmCipher, EncryptionKey};
use crate::engine::schema::prepare_schema;
use crate::engine::{
    DatabaseEngine, MetaTablesSchema, OpenOptions, SchemaHooks, SqliteEngine, CURRENT_SCHEMA_VERSION,
};
use crate::errors::{BulkOutcome, StoreResult};
use crate::fs_util;
use crate::handle::StoreHandle;
use crate::naming::{
    AccountIdentity, StorageLayout, StoreName, TenantKey, DB_NAME_SUFFIX, ORG_KEY_PREFIX,
};
use crate::registry::StoreRegistry;
use crate::telemetry::{MetricsEventSink, NoopEventSink, UsageEvent, UsageEventSink};
use metrics::counter;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

/// Files SQLite may leave next to a database
const COMPANION_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Owns the registry of open stores for one storage root
pub struct LifecycleManager {
    layout: StorageLayout,
    engine: Arc<dyn DatabaseEngine>,
    hooks: Arc<dyn SchemaHooks>,
    events: Arc<dyn UsageEventSink>,
    blobs: BlobStore,
    registry: StoreRegistry<StoreHandle>,
}

impl LifecycleManager {
    /// Build a manager from its collaborators. Usage events are dropped
    /// until a sink is set with [`with_event_sink`](Self::with_event_sink).
    pub fn new(
        layout: StorageLayout,
        engine: Arc<dyn DatabaseEngine>,
        hooks: Arc<dyn SchemaHooks>,
        blobs: BlobStore,
    ) -> Self {
        Self {
            layout,
            engine,
            hooks,
            events: Arc::new(NoopEventSink),
            blobs,
            registry: StoreRegistry::new(),
        }
    }

    /// SQLite engine, meta-table schema, AES-GCM blobs and metrics events
    pub fn from_config(config: &SoupstoreConfig) -> StoreResult<Self> {
        let layout = StorageLayout::new(&config.storage.storage_root);
        let cipher = AesGcmCipher::new(&config.crypto)?;
        let blobs = BlobStore::new(layout.clone(), Arc::new(cipher));

        Ok(Self::new(
            layout,
            Arc::new(SqliteEngine::new(config.storage.sqlcipher_compat)),
            Arc::new(MetaTablesSchema::new(config.storage.wal)),
            blobs,
        )
        .with_event_sink(Arc::new(MetricsEventSink)))
    }

    pub fn with_event_sink(mut self, events: Arc<dyn UsageEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Blob store sharing this manager's storage root
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Return the open store of `tenant`, opening (and creating or
    /// upgrading) it on first use.
    ///
    /// Concurrent callers for the same tenant share one handle; the database
    /// is opened and the usage event recorded only once. An open that fails
    /// records no event and leaves nothing registered, so the next call
    /// tries again.
    pub fn open(&self, tenant: &TenantKey, key: &EncryptionKey) -> StoreResult<Arc<StoreHandle>> {
        let name = tenant.store_name()?;
        self.registry
            .get_or_create(&name, || self.create_handle(tenant, &name, key))
    }

    fn create_handle(
        &self,
        tenant: &TenantKey,
        name: &StoreName,
        key: &EncryptionKey,
    ) -> StoreResult<StoreHandle> {
        fs::create_dir_all(self.layout.databases_dir())?;
        // Counted before this store's file exists
        let event = self.init_event(tenant);

        let db_path = self.layout.database_path(name);
        // Access is serialized by StoreHandle, not by the engine
        let options = OpenOptions {
            internal_locking: false,
        };
        let mut conn = self.engine.open(&db_path, key, options)?;

        let version = match prepare_schema(conn.as_mut(), self.hooks.as_ref(), CURRENT_SCHEMA_VERSION) {
            Ok(version) => version,
            Err(e) => {
                if let Err(close_err) = conn.close() {
                    warn!(store = %name, error = %close_err, "Failed to close store after schema error");
                }
                return Err(e);
            }
        };

        self.events.record(&event);
        info!(store = %name, schema_version = version, "Opened store");
        counter!("lifecycle.stores_opened").increment(1);

        Ok(StoreHandle::new(
            name.clone(),
            db_path,
            self.layout.blob_root(name),
            version,
            conn,
        ))
    }

    fn init_event(&self, tenant: &TenantKey) -> UsageEvent {
        match tenant.account() {
            None => UsageEvent::global_store_init(self.count_or_zero(self.global_database_names())),
            Some(account) => UsageEvent::user_store_init(
                self.count_or_zero(self.user_database_names(account.as_ref())),
            ),
        }
    }

    fn count_or_zero(&self, names: StoreResult<Vec<StoreName>>) -> usize {
        names.map(|names| names.len()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count existing stores");
            0
        })
    }

    /// Whether the database file of `tenant` exists. Does not open it.
    pub fn exists(&self, tenant: &TenantKey) -> StoreResult<bool> {
        let name = tenant.store_name()?;
        Ok(self.layout.database_path(&name).is_file())
    }

    /// Delete the store of `tenant` with its external blobs.
    ///
    /// For an account tenant without a community id this also deletes every
    /// other store of the same account. Deleting a store that does not exist
    /// succeeds.
    pub fn delete(&self, tenant: &TenantKey) -> StoreResult<BulkOutcome> {
        let name = tenant.store_name()?;
        let mut outcome = BulkOutcome::new();

        if let Some(handle) = self.registry.remove(&name)? {
            close_handle(&handle, &mut outcome);
        }
        self.delete_database_files(&name, &mut outcome);

        if tenant.community_id().is_none() {
            if let Some(prefix) = tenant.account_wide_prefix() {
                outcome.merge(self.delete_matching(|file| file.starts_with(&prefix))?);
            }
        }

        outcome.merge(self.blobs.remove_store_blobs(&name));

        info!(
            store = %name,
            processed = outcome.processed,
            failures = outcome.failures.len(),
            "Deleted store"
        );
        Ok(outcome)
    }

    /// Delete every store of `account`, under any name prefix
    pub fn delete_all_for_account(&self, account: &dyn AccountIdentity) -> StoreResult<BulkOutcome> {
        let marker = format!("{}_", account.user_level_suffix());
        self.delete_matching(|file| file.contains(&marker))
    }

    /// Delete every store that belongs to some account, keeping global stores
    pub fn delete_all_authenticated(&self) -> StoreResult<BulkOutcome> {
        let marker = format!("_{ORG_KEY_PREFIX}");
        self.delete_matching(|file| file.contains(&marker))
    }

    /// Snapshot of every store currently open
    pub fn open_stores(&self) -> StoreResult<HashMap<StoreName, Arc<StoreHandle>>> {
        self.registry.snapshot()
    }

    /// Evict and close every open store
    pub fn close_all(&self) -> StoreResult<BulkOutcome> {
        let mut outcome = BulkOutcome::new();
        for (_, handle) in self.registry.remove_where(|_| true)? {
            close_handle(&handle, &mut outcome);
        }
        Ok(outcome)
    }

    /// Database files on disk belonging to `account`
    pub fn user_database_names(&self, account: &dyn AccountIdentity) -> StoreResult<Vec<StoreName>> {
        let marker = format!("{}_", account.user_level_suffix());
        self.database_names(|file| file.contains(&marker))
    }

    /// Database files on disk not tied to any account
    pub fn global_database_names(&self) -> StoreResult<Vec<StoreName>> {
        let marker = format!("_{ORG_KEY_PREFIX}");
        self.database_names(|file| !file.contains(&marker))
    }

    fn database_names<P>(&self, predicate: P) -> StoreResult<Vec<StoreName>>
    where
        P: Fn(&str) -> bool,
    {
        let files = fs_util::list_files(&self.layout.databases_dir(), |file| {
            file.ends_with(DB_NAME_SUFFIX) && predicate(file)
        })?;

        Ok(files
            .iter()
            .filter_map(|path| path.file_name()?.to_str())
            .filter_map(|file| StoreName::from_file_name(file).ok())
            .collect())
    }

    /// Evict, close and delete every store whose file name matches
    fn delete_matching<P>(&self, predicate: P) -> StoreResult<BulkOutcome>
    where
        P: Fn(&str) -> bool,
    {
        let mut outcome = BulkOutcome::new();
        let mut names = BTreeSet::new();

        for (name, handle) in self.registry.remove_where(|name| predicate(name.as_str()))? {
            close_handle(&handle, &mut outcome);
            names.insert(name);
        }

        match self.database_names(&predicate) {
            Ok(on_disk) => names.extend(on_disk),
            Err(e) => {
                warn!(error = %e, "Failed to list databases");
                outcome.record_failure(self.layout.databases_dir(), e);
            }
        }

        for name in &names {
            self.delete_database_files(name, &mut outcome);
            outcome.merge(self.blobs.remove_store_blobs(name));
        }

        if !names.is_empty() {
            info!(stores = names.len(), failures = outcome.failures.len(), "Deleted matching stores");
        }
        Ok(outcome)
    }

    /// Remove the database file and whatever SQLite left next to it
    fn delete_database_files(&self, name: &StoreName, outcome: &mut BulkOutcome) {
        let db_path = self.layout.database_path(name);
        let mut paths = vec![db_path.clone()];
        for suffix in COMPANION_SUFFIXES {
            let mut companion = db_path.clone().into_os_string();
            companion.push(suffix);
            paths.push(companion.into());
        }

        for path in paths {
            match fs_util::remove_file_if_exists(&path) {
                Ok(()) => outcome.record_success(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete database file");
                    outcome.record_failure(&path, e.into());
                }
            }
        }
    }
}

fn close_handle(handle: &StoreHandle, outcome: &mut BulkOutcome) {
    match handle.close() {
        Ok(()) => outcome.record_success(),
        Err(e) => {
            warn!(store = %handle.name(), error = %e, "Failed to close store");
            outcome.record_failure(handle.db_path(), e);
        }
    }
}
