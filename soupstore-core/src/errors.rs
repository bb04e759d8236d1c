/*
    errors.rs - Error and outcome types for the store subsystem

    Hard errors (`StoreError`) surface malformed names, schema trouble and
    database failures. Best-effort bulk work (blob deletes, tree removal,
    rekey, tenant deletion) reports a `BulkOutcome` instead, so one bad
    item never hides the rest.
*/

use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed tenant, store or table identifier
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// File create/read/write/delete failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encrypt/decrypt failure (wrong key, corrupted ciphertext)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Schema creation or upgrade could not be completed
    #[error("Schema upgrade failed from version {from} to {to}: {reason}")]
    SchemaUpgrade { from: u32, to: u32, reason: String },

    /// The database engine refused an operation
    #[error("Database error: {0}")]
    Database(String),

    /// The store handle was closed by a delete or shutdown
    #[error("Store is closed: {0}")]
    Closed(String),

    /// A thread panicked while holding an internal lock
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Helper to convert poison errors into StoreError
pub(crate) fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::LockPoisoned("a thread panicked while holding the lock".to_string())
}

/// A single item that failed inside a bulk operation
#[derive(Debug)]
pub struct ItemFailure {
    /// File or directory the failure refers to
    pub path: PathBuf,
    /// What went wrong
    pub error: StoreError,
}

/// Aggregate result of a best-effort bulk operation.
///
/// Every item is attempted regardless of earlier failures; `succeeded()` is
/// the logical AND of all individual outcomes.
#[derive(Debug)]
pub struct BulkOutcome {
    /// Number of items that were attempted
    pub processed: usize,
    /// Items that failed, in the order they were attempted
    pub failures: Vec<ItemFailure>,
    /// Whether the root the operation works on existed at all
    pub root_found: bool,
}

impl BulkOutcome {
    /// An empty outcome for an operation whose root exists
    pub fn new() -> Self {
        Self {
            processed: 0,
            failures: Vec::new(),
            root_found: true,
        }
    }

    /// An outcome for an operation whose root did not exist
    pub fn missing_root() -> Self {
        Self {
            root_found: false,
            ..Self::new()
        }
    }

    /// Record one successful item
    pub fn record_success(&mut self) {
        self.processed += 1;
    }

    /// Record one failed item
    pub fn record_failure(&mut self, path: impl AsRef<Path>, error: StoreError) {
        self.processed += 1;
        self.failures.push(ItemFailure {
            path: path.as_ref().to_path_buf(),
            error,
        });
    }

    /// Fold another outcome's items into this one.
    ///
    /// The root flag is left alone: a sub-step working on an optional
    /// directory must not turn the parent operation into a failure.
    pub fn merge(&mut self, other: BulkOutcome) {
        self.processed += other.processed;
        self.failures.extend(other.failures);
    }

    /// True when the root existed and every item succeeded
    pub fn succeeded(&self) -> bool {
        self.root_found && self.failures.is_empty()
    }
}

impl Default for BulkOutcome {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InvalidName("a/b".to_string());
        assert_eq!(err.to_string(), "Invalid name: a/b");
    }

    #[test]
    fn test_schema_upgrade_display() {
        let err = StoreError::SchemaUpgrade {
            from: 1,
            to: 3,
            reason: "disk full".to_string(),
        };
        assert!(err.to_string().contains("from version 1"));
        assert!(err.to_string().contains("to 3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_bulk_outcome_aggregation() {
        let mut outcome = BulkOutcome::new();
        assert!(outcome.succeeded());

        outcome.record_success();
        outcome.record_failure("/tmp/x", StoreError::Encryption("bad tag".to_string()));
        outcome.record_success();

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_missing_root_is_not_success() {
        let outcome = BulkOutcome::missing_root();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.processed, 0);
    }

    #[test]
    fn test_merge_keeps_parent_root_flag() {
        let mut parent = BulkOutcome::new();
        parent.merge(BulkOutcome::missing_root());
        assert!(parent.succeeded());

        let mut child = BulkOutcome::new();
        child.record_failure("/tmp/y", StoreError::Closed("s".to_string()));
        parent.merge(child);
        assert!(!parent.succeeded());
        assert_eq!(parent.processed, 1);
    }
}
