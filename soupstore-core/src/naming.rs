//! Tenant naming scheme
//!
//! Maps a tenant (name prefix, account, optional community) to the canonical
//! store name and derives every on-disk location from it:
//!
//! ```text
//! <root>/databases/<prefix><suffix>.db
//! <root>/databases/<prefix><suffix>.db_external_soup_blobs/<table>/soupelt_<id>
//! ```
//!
//! Everything here is a pure function of its inputs.

use crate::errors::{StoreError, StoreResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory under the storage root holding every database
pub const DATABASES_DIR: &str = "databases";

/// Extension carried by every store name
pub const DB_NAME_SUFFIX: &str = ".db";

/// Appended to a store name to form its blob root directory
pub const EXTERNAL_BLOBS_SUFFIX: &str = "_external_soup_blobs";

/// File name prefix for externalized soup elements
pub const SOUP_ELEMENT_PREFIX: &str = "soupelt_";

/// Default store name prefix
pub const DEFAULT_DB_NAME: &str = "smartstore";

/// Leading characters of every org id; marks authenticated store names
pub const ORG_KEY_PREFIX: &str = "00D";

/// Community leaf used when no community is given
pub const INTERNAL_COMMUNITY: &str = "internal";

/// Canonical store name, e.g. `smartstore_00D1_0051_internal.db`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreName(String);

impl StoreName {
    /// Wrap an existing database file name (must end with `.db`)
    pub fn from_file_name(name: &str) -> StoreResult<Self> {
        let stem = name.strip_suffix(DB_NAME_SUFFIX).ok_or_else(|| {
            StoreError::InvalidName(format!("database file name must end with {DB_NAME_SUFFIX}: {name}"))
        })?;
        validate_path_segment("store name", stem)?;
        Ok(Self(name.to_string()))
    }

    /// Full name including the `.db` suffix
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the filename suffixes that encode an account's identity.
pub trait AccountIdentity: fmt::Debug + Send + Sync {
    /// Suffix shared by every store of this account, regardless of community
    fn user_level_suffix(&self) -> String;

    /// Suffix of one community's store. `None` selects the internal community.
    fn community_level_suffix(&self, community_id: Option<&str>) -> String;
}

/// Default account identity: an org id plus a user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserAccount {
    org_id: String,
    user_id: String,
}

impl UserAccount {
    /// Create an account identity.
    ///
    /// Ids must be non-empty ASCII alphanumerics or `-` so suffixes stay
    /// unambiguous, and the org id must start with [`ORG_KEY_PREFIX`].
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> StoreResult<Self> {
        let org_id = org_id.into();
        let user_id = user_id.into();
        validate_identifier("org id", &org_id)?;
        validate_identifier("user id", &user_id)?;
        if !org_id.starts_with(ORG_KEY_PREFIX) {
            return Err(StoreError::InvalidName(format!(
                "org id must start with {ORG_KEY_PREFIX}: {org_id}"
            )));
        }
        Ok(Self { org_id, user_id })
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl AccountIdentity for UserAccount {
    fn user_level_suffix(&self) -> String {
        format!("_{}_{}", self.org_id, self.user_id)
    }

    fn community_level_suffix(&self, community_id: Option<&str>) -> String {
        let leaf = community_id.unwrap_or(INTERNAL_COMMUNITY);
        format!("{}_{}", self.user_level_suffix(), leaf)
    }
}

/// Identifies one tenant's storage
#[derive(Debug, Clone)]
pub struct TenantKey {
    name_prefix: String,
    account: Option<Arc<dyn AccountIdentity>>,
    community_id: Option<String>,
}

impl TenantKey {
    /// The unauthenticated/global store for `name_prefix`
    pub fn global(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            account: None,
            community_id: None,
        }
    }

    /// A store scoped to an account and optionally one of its communities.
    ///
    /// An empty community id is the same as none. The id `internal` is
    /// reserved for the account's default community and rejected.
    pub fn for_account(
        name_prefix: impl Into<String>,
        account: Arc<dyn AccountIdentity>,
        community_id: Option<&str>,
    ) -> StoreResult<Self> {
        let community_id = match community_id {
            None | Some("") => None,
            Some(INTERNAL_COMMUNITY) => {
                return Err(StoreError::InvalidName(format!(
                    "community id '{INTERNAL_COMMUNITY}' is reserved"
                )))
            }
            Some(id) => {
                validate_identifier("community id", id)?;
                Some(id.to_string())
            }
        };

        Ok(Self {
            name_prefix: name_prefix.into(),
            account: Some(account),
            community_id,
        })
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    pub fn account(&self) -> Option<&Arc<dyn AccountIdentity>> {
        self.account.as_ref()
    }

    pub fn community_id(&self) -> Option<&str> {
        self.community_id.as_deref()
    }

    /// Account suffix for this tenant; `None` for the global store
    pub fn account_suffix(&self) -> Option<String> {
        self.account
            .as_ref()
            .map(|account| account.community_level_suffix(self.community_id()))
    }

    /// Canonical store name of this tenant
    pub fn store_name(&self) -> StoreResult<StoreName> {
        derive_store_name(&self.name_prefix, self.account_suffix().as_deref())
    }

    /// Name prefix shared by every community store of this tenant's account.
    ///
    /// Ends with the separator that precedes the community leaf, so
    /// `smartstore_00D1_005a_` never matches user `005ab`.
    pub fn account_wide_prefix(&self) -> Option<String> {
        self.account
            .as_ref()
            .map(|account| format!("{}{}_", self.name_prefix, account.user_level_suffix()))
    }
}

/// `prefix + account_suffix + ".db"`. Fails only on an invalid prefix.
pub fn derive_store_name(prefix: &str, account_suffix: Option<&str>) -> StoreResult<StoreName> {
    validate_name_prefix(prefix)?;
    let suffix = account_suffix.unwrap_or("");
    if suffix.contains(['/', '\\']) {
        return Err(StoreError::InvalidName(format!(
            "account suffix contains a path separator: {suffix}"
        )));
    }
    Ok(StoreName(format!("{prefix}{suffix}{DB_NAME_SUFFIX}")))
}

/// A name prefix must be one path segment and must not contain `_00D`:
/// global and authenticated stores are told apart by that marker.
pub fn validate_name_prefix(prefix: &str) -> StoreResult<()> {
    validate_path_segment("store name prefix", prefix)?;
    if prefix.contains(&format!("_{ORG_KEY_PREFIX}")) {
        return Err(StoreError::InvalidName(format!(
            "store name prefix contains the org marker _{ORG_KEY_PREFIX}: {prefix}"
        )));
    }
    Ok(())
}

/// Soup table names become directory names and must be a single segment
pub fn validate_table_name(table: &str) -> StoreResult<()> {
    validate_path_segment("table name", table)
}

fn validate_path_segment(what: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidName(format!("{what} is empty")));
    }
    if value.contains(['/', '\\', '\0']) || value == "." || value == ".." {
        return Err(StoreError::InvalidName(format!(
            "{what} is not a single path segment: {value}"
        )));
    }
    Ok(())
}

fn validate_identifier(what: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(StoreError::InvalidName(format!(
            "{what} must be non-empty ASCII alphanumerics or '-': {value:?}"
        )));
    }
    Ok(())
}

/// Resolves store names to paths under a fixed storage root
#[derive(Debug, Clone)]
pub struct StorageLayout {
    storage_root: PathBuf,
}

impl StorageLayout {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// `<root>/databases`
    pub fn databases_dir(&self) -> PathBuf {
        self.storage_root.join(DATABASES_DIR)
    }

    /// `<root>/databases/<store>`
    pub fn database_path(&self, store: &StoreName) -> PathBuf {
        self.databases_dir().join(store.as_str())
    }

    /// `<root>/databases/<store>_external_soup_blobs`
    pub fn blob_root(&self, store: &StoreName) -> PathBuf {
        self.databases_dir()
            .join(format!("{}{}", store.as_str(), EXTERNAL_BLOBS_SUFFIX))
    }

    /// Blob folder of one soup table
    pub fn table_dir(&self, store: &StoreName, table: &str) -> StoreResult<PathBuf> {
        validate_table_name(table)?;
        Ok(self.blob_root(store).join(table))
    }

    /// Deterministic file of one externalized element
    pub fn blob_path(&self, store: &StoreName, table: &str, entry_id: u64) -> StoreResult<PathBuf> {
        Ok(self
            .table_dir(store, table)?
            .join(format!("{SOUP_ELEMENT_PREFIX}{entry_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn account(org: &str, user: &str) -> Arc<dyn AccountIdentity> {
        Arc::new(UserAccount::new(org, user).unwrap())
    }

    #[test]
    fn test_global_store_name() {
        let key = TenantKey::global(DEFAULT_DB_NAME);
        assert_eq!(key.store_name().unwrap().as_str(), "smartstore.db");
        assert!(key.account_wide_prefix().is_none());
    }

    #[test]
    fn test_internal_and_community_names_differ() {
        let acct = account("00D1", "u1");
        let internal = TenantKey::for_account("smartstore", acct.clone(), None).unwrap();
        let community = TenantKey::for_account("smartstore", acct, Some("c1")).unwrap();

        assert_eq!(
            internal.store_name().unwrap().as_str(),
            "smartstore_00D1_u1_internal.db"
        );
        assert_eq!(
            community.store_name().unwrap().as_str(),
            "smartstore_00D1_u1_c1.db"
        );
    }

    #[test]
    fn test_empty_community_is_none() {
        let acct = account("00D1", "u1");
        let a = TenantKey::for_account("smartstore", acct.clone(), Some("")).unwrap();
        let b = TenantKey::for_account("smartstore", acct, None).unwrap();
        assert_eq!(a.store_name().unwrap(), b.store_name().unwrap());
        assert!(a.community_id().is_none());
    }

    #[test]
    fn test_reserved_community_rejected() {
        let acct = account("00D1", "u1");
        let result = TenantKey::for_account("smartstore", acct, Some("internal"));
        assert!(matches!(result, Err(StoreError::InvalidName(_))));
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!(matches!(derive_store_name("", None), Err(StoreError::InvalidName(_))));
        assert!(matches!(derive_store_name("a/b", None), Err(StoreError::InvalidName(_))));
        assert!(matches!(derive_store_name("a\\b", None), Err(StoreError::InvalidName(_))));
        assert!(matches!(derive_store_name("..", None), Err(StoreError::InvalidName(_))));
    }

    #[test]
    fn test_prefix_with_org_marker_rejected() {
        assert!(matches!(
            derive_store_name("cache_00Dx", None),
            Err(StoreError::InvalidName(_))
        ));
        let acct = account("00D1", "u1");
        let key = TenantKey::for_account("app_00D", acct, None).unwrap();
        assert!(matches!(key.store_name(), Err(StoreError::InvalidName(_))));

        // The marker needs the leading separator
        assert!(derive_store_name("cache00D", None).is_ok());
        assert!(derive_store_name("my_store", None).is_ok());
    }

    #[test]
    fn test_invalid_account_ids() {
        assert!(UserAccount::new("00D1", "").is_err());
        assert!(UserAccount::new("00D1", "a_b").is_err());
        assert!(UserAccount::new("00D1", "../x").is_err());
        assert!(UserAccount::new("XYZ", "u1").is_err());
    }

    #[test]
    fn test_account_wide_prefix_ends_with_separator() {
        let acct = account("00D1", "005a");
        let key = TenantKey::for_account("smartstore", acct, Some("c9")).unwrap();
        assert_eq!(key.account_wide_prefix().unwrap(), "smartstore_00D1_005a_");
    }

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data/app");
        let name = derive_store_name("smartstore", None).unwrap();

        assert_eq!(
            layout.database_path(&name),
            PathBuf::from("/data/app/databases/smartstore.db")
        );
        assert_eq!(
            layout.blob_root(&name),
            PathBuf::from("/data/app/databases/smartstore.db_external_soup_blobs")
        );
        assert_eq!(
            layout.blob_path(&name, "TABLE_1", 42).unwrap(),
            PathBuf::from("/data/app/databases/smartstore.db_external_soup_blobs/TABLE_1/soupelt_42")
        );
    }

    #[test]
    fn test_table_name_with_separator_rejected() {
        let layout = StorageLayout::new("/data/app");
        let name = derive_store_name("smartstore", None).unwrap();
        assert!(matches!(
            layout.blob_path(&name, "../escape", 1),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_store_name_from_file_name() {
        assert!(StoreName::from_file_name("smartstore.db").is_ok());
        assert!(StoreName::from_file_name("smartstore").is_err());
        assert!(StoreName::from_file_name(".db").is_err());
    }

    fn id_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z0-9-]{1,8}"
    }

    proptest! {
        #[test]
        fn prop_distinct_tenants_have_distinct_names(
            user_a in id_strategy(),
            user_b in id_strategy(),
            community_a in proptest::option::of(id_strategy()),
            community_b in proptest::option::of(id_strategy()),
        ) {
            prop_assume!(community_a.as_deref() != Some(INTERNAL_COMMUNITY));
            prop_assume!(community_b.as_deref() != Some(INTERNAL_COMMUNITY));
            prop_assume!((&user_a, &community_a) != (&user_b, &community_b));

            let a = TenantKey::for_account(
                "smartstore",
                account("00Dorg", &user_a),
                community_a.as_deref(),
            ).unwrap();
            let b = TenantKey::for_account(
                "smartstore",
                account("00Dorg", &user_b),
                community_b.as_deref(),
            ).unwrap();

            prop_assert_ne!(a.store_name().unwrap(), b.store_name().unwrap());
        }

        #[test]
        fn prop_derivation_is_deterministic(user in id_strategy()) {
            let key = TenantKey::for_account("smartstore", account("00Dorg", &user), None).unwrap();
            prop_assert_eq!(key.store_name().unwrap(), key.store_name().unwrap());
        }
    }
}
