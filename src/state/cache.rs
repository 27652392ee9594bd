//! Cached metadata documents.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{StateStore, atomic, validate_name};
use crate::error::Result;
use crate::types::ShowMetadata;

const DOCUMENT_EXTENSION: &str = "json";

impl StateStore {
    /// Path of the document for `identifier`
    ///
    /// With partitioning enabled documents live under `cache_dir/<collection>/`.
    pub fn document_path(&self, collection: &str, identifier: &str) -> Result<PathBuf> {
        validate_name(identifier)?;
        let dir = if self.partition_by_collection {
            validate_name(collection)?;
            self.cache_dir.join(collection)
        } else {
            self.cache_dir.clone()
        };
        Ok(dir.join(format!("{identifier}.{DOCUMENT_EXTENSION}")))
    }

    /// Persist a document under its own identifier, wholly replacing any
    /// previous version
    pub async fn save_metadata(&self, collection: &str, metadata: &ShowMetadata) -> Result<PathBuf> {
        let path = self.document_path(collection, &metadata.identifier)?;
        atomic::write_json(&path, metadata).await?;
        tracing::debug!(
            collection = %collection,
            identifier = %metadata.identifier,
            path = %path.display(),
            "Cached metadata document"
        );
        Ok(path)
    }

    /// Load a cached document
    ///
    /// Returns `None` when the document is missing or does not parse and
    /// validate; a corrupt document is never a cache hit.
    pub async fn load_metadata(
        &self,
        collection: &str,
        identifier: &str,
    ) -> Result<Option<ShowMetadata>> {
        let path = self.document_path(collection, identifier)?;
        Ok(read_document(&path, Some(identifier)).await?)
    }

    /// Whether a valid document exists for `identifier`
    pub async fn is_cached(&self, collection: &str, identifier: &str) -> bool {
        matches!(self.load_metadata(collection, identifier).await, Ok(Some(_)))
    }

    /// Identifiers with a valid cached document for `collection`
    ///
    /// In a partitioned cache this lists the collection's directory. In a flat
    /// cache documents are attributed by any of their collection tags.
    pub async fn cached_identifiers(&self, collection: &str) -> Result<BTreeSet<String>> {
        let dir = if self.partition_by_collection {
            validate_name(collection)?;
            self.cache_dir.join(collection)
        } else {
            self.cache_dir.clone()
        };

        let mut found = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(identifier) = document_stem(&path) else {
                continue;
            };
            let Some(document) = read_document(&path, Some(&identifier)).await? else {
                continue;
            };
            if self.partition_by_collection || document.belongs_to(collection) {
                found.insert(identifier);
            }
        }

        Ok(found)
    }

    /// Collection partitions present in the cache tree
    pub(crate) async fn partitions_on_disk(&self) -> Result<Vec<String>> {
        if !self.partition_by_collection {
            return Ok(Vec::new());
        }
        let mut partitions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(partitions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_name(name).is_ok()
            {
                partitions.push(name.to_string());
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

/// Identifier for a document file name; `None` for temp files and non-documents
fn document_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') || name.ends_with(atomic::TEMP_SUFFIX) {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{DOCUMENT_EXTENSION}"))?;
    (!stem.is_empty()).then(|| stem.to_string())
}

async fn read_document(path: &Path, expected: Option<&str>) -> std::io::Result<Option<ShowMetadata>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let document: ShowMetadata = match serde_json::from_slice(&bytes) {
        Ok(document) => document,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unparseable cached document");
            return Ok(None);
        }
    };

    if let Err(reason) = document.validate() {
        tracing::warn!(path = %path.display(), reason = %reason, "Ignoring invalid cached document");
        return Ok(None);
    }
    if let Some(expected) = expected
        && document.identifier != expected
    {
        tracing::warn!(
            path = %path.display(),
            found = %document.identifier,
            expected = %expected,
            "Ignoring cached document stored under the wrong identifier"
        );
        return Ok(None);
    }

    Ok(Some(document))
}
