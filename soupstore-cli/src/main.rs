use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use soupstore_core::logging::{init_logging_with_config, LogConfig};
use soupstore_core::{
    AccountIdentity, BulkOutcome, EncryptionKey, KeyRotationService, LifecycleManager,
    SoupstoreConfig, TenantKey, UserAccount,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "soupstore")]
#[command(author, version, about = "Manage per-tenant encrypted stores", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Storage root; overrides the configuration
    #[arg(short, long)]
    root: Option<String>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Encryption key of the store
    #[arg(short, long, env = "SOUPSTORE_KEY", hide_env_values = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Which store a command works on. Without `--org`/`--user` it is the global store.
#[derive(ClapArgs, Debug, Clone)]
struct TenantArgs {
    /// Store name prefix; defaults to the configured one
    #[arg(long)]
    prefix: Option<String>,

    /// Org id of the account
    #[arg(long, requires = "user")]
    org: Option<String>,

    /// User id of the account
    #[arg(long, requires = "org")]
    user: Option<String>,

    /// Community id; omit for the account's internal community
    #[arg(long, requires = "user")]
    community: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open (creating or upgrading) a store
    Open {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Check whether a store's database exists
    Exists {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Delete a store and its blobs; without --community, every store of the account
    Delete {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Delete every store of one account
    DeleteAccount {
        #[arg(long)]
        org: String,
        #[arg(long)]
        user: String,
    },
    /// Delete every account store, keeping global stores
    DeleteAuthenticated,
    /// Encrypt and store one blob
    BlobPut {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        table: String,
        #[arg(long)]
        id: u64,
        /// Value to store
        value: String,
    },
    /// Print one blob
    BlobGet {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        table: String,
        #[arg(long)]
        id: u64,
    },
    /// Delete blobs by id
    BlobDelete {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        table: String,
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Print the bytes used by a store's blobs
    BlobSize {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        table: Option<String>,
    },
    /// Re-encrypt a store's database and blobs under a new key
    Rekey {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long, env = "SOUPSTORE_NEW_KEY", hide_env_values = true)]
        new_key: String,
        /// Leave the database alone and re-encrypt only the external blobs
        #[arg(long)]
        blobs_only: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let log_config = LogConfig::try_from(&config.logging)?;
    init_logging_with_config(log_config)?;

    info!(root = %config.storage.storage_root.display(), "soupstore started");
    run(&args, &config)
}

/// Defaults, then the config file, then `SOUPSTORE_*`, then flags
fn load_config(args: &Args) -> Result<SoupstoreConfig> {
    let mut config = match &args.config {
        Some(path) => SoupstoreConfig::from_file(expand(path))
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => SoupstoreConfig::default(),
    };
    config.apply_env()?;

    if let Some(root) = &args.root {
        config.storage.storage_root = expand(root);
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config.validate()?;
    Ok(config)
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn run(args: &Args, config: &SoupstoreConfig) -> Result<()> {
    let manager = LifecycleManager::from_config(config)?;

    match &args.command {
        Command::Open { tenant } => {
            let tenant = tenant_key(tenant, config)?;
            let handle = manager.open(&tenant, &require_key(args)?)?;
            println!(
                "{} (schema version {})",
                handle.db_path().display(),
                handle.schema_version()
            );
            manager.close_all()?;
        }
        Command::Exists { tenant } => {
            let tenant = tenant_key(tenant, config)?;
            println!("{}", manager.exists(&tenant)?);
        }
        Command::Delete { tenant } => {
            let tenant = tenant_key(tenant, config)?;
            report(manager.delete(&tenant)?)?;
        }
        Command::DeleteAccount { org, user } => {
            let account = UserAccount::new(org.as_str(), user.as_str())?;
            report(manager.delete_all_for_account(&account)?)?;
        }
        Command::DeleteAuthenticated => {
            report(manager.delete_all_authenticated()?)?;
        }
        Command::BlobPut {
            tenant,
            table,
            id,
            value,
        } => {
            let name = tenant_key(tenant, config)?.store_name()?;
            if !manager.blobs().save_str(&name, table, *id, value, &require_key(args)?)? {
                bail!("Failed to store blob {} in {}", id, table);
            }
        }
        Command::BlobGet { tenant, table, id } => {
            let name = tenant_key(tenant, config)?.store_name()?;
            match manager.blobs().load_string(&name, table, *id, &require_key(args)?)? {
                Some(value) => println!("{}", value),
                None => bail!("No readable blob {} in {}", id, table),
            }
        }
        Command::BlobDelete { tenant, table, ids } => {
            let name = tenant_key(tenant, config)?.store_name()?;
            report(manager.blobs().delete(&name, table, ids)?)?;
        }
        Command::BlobSize { tenant, table } => {
            let name = tenant_key(tenant, config)?.store_name()?;
            println!("{}", manager.blobs().size_of(&name, table.as_deref())?);
        }
        Command::Rekey {
            tenant,
            new_key,
            blobs_only,
        } => {
            let tenant = tenant_key(tenant, config)?;
            let old_key = require_key(args)?;
            let new_key = EncryptionKey::new(new_key.as_str());
            let rotation = KeyRotationService::new(manager.blobs().clone());

            let outcome = if *blobs_only {
                rotation.rotate_blob_keys(&tenant.store_name()?, &old_key, &new_key)
            } else {
                let handle = manager.open(&tenant, &old_key)?;
                let rotated = rotation.rotate_key(&handle, &old_key, &new_key);
                manager.close_all()?;
                rotated.context("Failed to rotate the database key")?
            };
            report(outcome)?;
        }
    }

    Ok(())
}

fn require_key(args: &Args) -> Result<EncryptionKey> {
    match &args.key {
        Some(key) => Ok(EncryptionKey::new(key.as_str())),
        None => bail!("An encryption key is required (--key or SOUPSTORE_KEY)"),
    }
}

fn tenant_key(args: &TenantArgs, config: &SoupstoreConfig) -> Result<TenantKey> {
    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| config.storage.name_prefix.clone());

    match (&args.org, &args.user) {
        (Some(org), Some(user)) => {
            let account: Arc<dyn AccountIdentity> = Arc::new(UserAccount::new(org.as_str(), user.as_str())?);
            Ok(TenantKey::for_account(prefix, account, args.community.as_deref())?)
        }
        _ => Ok(TenantKey::global(prefix)),
    }
}

/// Print what a bulk operation did; fails when any item failed
fn report(outcome: BulkOutcome) -> Result<()> {
    for failure in &outcome.failures {
        warn!(path = %failure.path.display(), error = %failure.error, "Item failed");
    }
    println!(
        "processed {}, failed {}",
        outcome.processed,
        outcome.failures.len()
    );
    if !outcome.failures.is_empty() {
        bail!("{} item(s) could not be processed", outcome.failures.len());
    }
    Ok(())
}
