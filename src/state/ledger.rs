//! Progress ledger: load, update, schema migration and recovery.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{StateStore, atomic, check_path_component};
use crate::error::{Result, StateError};
use crate::types::{CollectionProgress, PROGRESS_SCHEMA_VERSION, ProgressStatus};

/// Aggregate progress document: one record per collection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Highest record version the writer understood
    #[serde(default)]
    pub schema_version: u32,
    /// Records keyed by collection id
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionProgress>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            collections: BTreeMap::new(),
        }
    }
}

impl Ledger {
    fn validate(&self) -> std::result::Result<(), String> {
        for (key, record) in &self.collections {
            if key.trim().is_empty() {
                return Err("record with empty collection key".to_string());
            }
            if record.collection != *key {
                return Err(format!(
                    "record under {key:?} names collection {:?}",
                    record.collection
                ));
            }
        }
        Ok(())
    }
}

impl StateStore {
    /// Load the ledger, migrating or recovering it as needed
    ///
    /// A missing ledger is empty. An unreadable or invalid one is moved aside
    /// and rebuilt from the cache tree; this never fails on corruption.
    pub async fn load_ledger(&self) -> Result<Ledger> {
        let _guard = self.ledger_mutex.lock().await;
        self.read_ledger().await
    }

    /// Replace the whole ledger
    pub async fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        let _guard = self.ledger_mutex.lock().await;
        atomic::write_json(&self.ledger_path, ledger).await
    }

    /// Record for one collection, if any run has touched it
    pub async fn progress(&self, collection: &str) -> Result<Option<CollectionProgress>> {
        Ok(self.load_ledger().await?.collections.remove(collection))
    }

    /// Every record in collection order
    pub async fn all_progress(&self) -> Result<Vec<CollectionProgress>> {
        Ok(self.load_ledger().await?.collections.into_values().collect())
    }

    /// Read-modify-write one collection's record and persist it
    ///
    /// The ledger is reloaded from disk inside the store mutex, so updates from
    /// concurrent tasks in this process are never lost. Returns the record as
    /// written.
    pub async fn update_progress<F>(&self, collection: &str, update: F) -> Result<CollectionProgress>
    where
        F: FnOnce(&mut CollectionProgress),
    {
        let _guard = self.ledger_mutex.lock().await;
        let mut ledger = self.read_ledger().await?;

        let record = ledger
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionProgress::new(collection));
        update(record);
        record.failed = record.failed_identifiers.len() as u64;
        record.schema_version = PROGRESS_SCHEMA_VERSION;
        record.updated_at = Some(Utc::now());
        let updated = record.clone();

        ledger.schema_version = PROGRESS_SCHEMA_VERSION;
        atomic::write_json(&self.ledger_path, &ledger).await?;
        Ok(updated)
    }

    /// Remove a collection's record; returns whether one existed
    pub async fn reset_progress(&self, collection: &str) -> Result<bool> {
        let _guard = self.ledger_mutex.lock().await;
        let mut ledger = self.read_ledger().await?;
        let removed = ledger.collections.remove(collection).is_some();
        if removed {
            atomic::write_json(&self.ledger_path, &ledger).await?;
            tracing::info!(collection = %collection, "Progress record reset");
        }
        Ok(removed)
    }

    /// Caller must hold `ledger_mutex`
    async fn read_ledger(&self) -> Result<Ledger> {
        let bytes = match tokio::fs::read(&self.ledger_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(e) => return self.recover_ledger(e.to_string()).await,
        };

        let parsed = serde_json::from_slice::<Ledger>(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|ledger| ledger.validate().map(|()| ledger));
        let mut ledger = match parsed {
            Ok(ledger) => ledger,
            Err(reason) => return self.recover_ledger(reason).await,
        };

        if migrate_ledger(&mut ledger) {
            atomic::write_json(&self.ledger_path, &ledger).await?;
            tracing::info!(
                path = %self.ledger_path.display(),
                version = PROGRESS_SCHEMA_VERSION,
                "Migrated progress ledger"
            );
        }

        Ok(ledger)
    }

    /// Move a bad ledger aside and rebuild it from the documents on disk
    async fn recover_ledger(&self, reason: String) -> Result<Ledger> {
        let corruption = StateError::Corrupt {
            path: self.ledger_path.clone(),
            reason,
        };
        tracing::warn!(error = %corruption, "Rebuilding progress ledger from cache");

        match atomic::move_aside(&self.ledger_path, "corrupt").await {
            Ok(moved) => tracing::warn!(moved_to = %moved.display(), "Corrupt ledger moved aside"),
            Err(e) => tracing::warn!(error = %e, "Could not move corrupt ledger aside"),
        }

        let mut names: BTreeSet<String> = self.known_collections.iter().cloned().collect();
        names.extend(self.partitions_on_disk().await?);

        let now = Utc::now();
        let mut ledger = Ledger::default();
        for name in names {
            if let Err(reason) = check_path_component(&name) {
                tracing::warn!(collection = %name, reason = %reason, "Skipping collection during recovery");
                continue;
            }
            let cached = self.cached_identifiers(&name).await?;
            let mut record = CollectionProgress::new(name.as_str());
            record.status = ProgressStatus::Recovered;
            record.downloaded = cached.len() as u64;
            record.last_processed = cached.iter().next_back().cloned();
            record.updated_at = Some(now);
            tracing::info!(collection = %name, documents = record.downloaded, "Recovered progress record");
            ledger.collections.insert(name, record);
        }

        atomic::write_json(&self.ledger_path, &ledger).await?;
        Ok(ledger)
    }
}

/// Upgrade every record to the current version; returns whether anything changed
fn migrate_ledger(ledger: &mut Ledger) -> bool {
    let mut changed = ledger.schema_version < PROGRESS_SCHEMA_VERSION;
    for record in ledger.collections.values_mut() {
        changed |= migrate_record(record);
    }
    if changed {
        ledger.schema_version = PROGRESS_SCHEMA_VERSION;
    }
    changed
}

fn migrate_record(record: &mut CollectionProgress) -> bool {
    let from = record.schema_version;
    if record.schema_version < 2 {
        migrate_v2(record);
        record.schema_version = 2;
    }
    if record.schema_version < 3 {
        migrate_v3(record);
        record.schema_version = 3;
    }
    from != record.schema_version
}

/// v2: `failed` is the length of a duplicate-free `failed_identifiers`
fn migrate_v2(record: &mut CollectionProgress) {
    let mut seen = BTreeSet::new();
    record
        .failed_identifiers
        .retain(|id| seen.insert(id.clone()));
    record.failed = record.failed_identifiers.len() as u64;
}

/// v3: sync watermarks; a completed v2 run was a full sync
fn migrate_v3(record: &mut CollectionProgress) {
    if record.status == ProgressStatus::Completed && record.last_full_sync.is_none() {
        record.last_full_sync = record.completed_at;
    }
}
