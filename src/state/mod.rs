//! Crash-safe persistence of the progress ledger and cached metadata.
//!
//! [`StateStore`] methods are organized by concern:
//! - [`ledger`] - Progress ledger access, schema migration and recovery
//! - [`cache`] - Per-identifier metadata documents
//! - [`atomic`] - Temp-file + rename write discipline shared by both

pub(crate) mod atomic;
mod cache;
mod ledger;

pub use ledger::Ledger;

use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::error::{Result, StateError};

/// Filesystem-backed state for the acquisition pipeline
///
/// All ledger read-modify-write cycles are serialized through an in-process
/// mutex and reload from disk each time. Cross-process serialization of a
/// collection's records is the job of the lock manager.
#[derive(Debug)]
pub struct StateStore {
    cache_dir: PathBuf,
    ledger_path: PathBuf,
    partition_by_collection: bool,
    known_collections: Vec<String>,
    ledger_mutex: tokio::sync::Mutex<()>,
}

impl StateStore {
    /// Create a store over the configured cache tree and ledger
    ///
    /// Nothing is touched on disk until the first read or write.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            ledger_path: config.ledger_path.clone(),
            partition_by_collection: config.partition_by_collection,
            known_collections: config.known_collections.clone(),
            ledger_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Root of the metadata cache
    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    /// Location of the progress ledger
    pub fn ledger_path(&self) -> &std::path::Path {
        &self.ledger_path
    }
}

/// Reject names that cannot be used as a single path component
pub(crate) fn check_path_component(value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        return Err("must not be empty".to_string());
    }
    if value == "." || value == ".." {
        return Err("must not be a relative path component".to_string());
    }
    if value.starts_with('.') {
        return Err("must not start with '.'".to_string());
    }
    if value.contains(['/', '\\', '\0']) {
        return Err("must not contain path separators".to_string());
    }
    Ok(())
}

fn invalid_identifier(identifier: &str, reason: String) -> crate::error::Error {
    StateError::InvalidIdentifier {
        identifier: identifier.to_string(),
        reason,
    }
    .into()
}

pub(crate) fn validate_name(value: &str) -> Result<()> {
    check_path_component(value).map_err(|reason| invalid_identifier(value, reason))
}
