//! In-memory catalog of saves backed up this session.

use crate::types::{BackupError, Result, SaveRecord};
use std::collections::HashMap;

/// Append-only mapping from content fingerprint to [`SaveRecord`].
///
/// Records keep their insertion order for display. Nothing is persisted; the
/// catalog starts empty on every run.
#[derive(Debug, Default)]
pub struct SaveCatalog {
    records: Vec<SaveRecord>,
    by_fingerprint: HashMap<String, usize>,
}

impl SaveCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.by_fingerprint.contains_key(fingerprint)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&SaveRecord> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|&index| &self.records[index])
    }

    /// Add a record.
    ///
    /// Callers check [`contains`](Self::contains) first; a duplicate here is a
    /// logic error and is rejected without touching the catalog.
    pub fn record(&mut self, record: SaveRecord) -> Result<()> {
        if self.contains(&record.fingerprint) {
            return Err(BackupError::DuplicateFingerprint(record.fingerprint));
        }

        self.by_fingerprint
            .insert(record.fingerprint.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &SaveRecord> {
        self.records.iter()
    }
}
