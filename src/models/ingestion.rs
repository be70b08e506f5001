//! Outcome of one archive ingestion run.

use crate::models::file_record::FileRecord;
use serde::{Serialize, Serializer, ser::SerializeStruct};

/// Why an entry was left out. Optional detail next to the coarse path list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyPath,
    TooDeep,
    OpenFailed,
    StoreFailed,
    RecordFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Internal path as it appeared in the container.
    pub path: String,
    pub reason: SkipReason,
}

/// Result of removing an object whose record could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    pub bucket: String,
    pub key: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionResult {
    pub uploaded: Vec<FileRecord>,
    pub skipped: Vec<SkippedEntry>,
    pub compensations: Vec<Compensation>,
}

impl IngestionResult {
    pub fn skip(&mut self, path: impl Into<String>, reason: SkipReason) {
        self.skipped.push(SkippedEntry {
            path: path.into(),
            reason,
        });
    }

    /// Original internal paths of every skipped entry, in skip order.
    pub fn skipped_paths(&self) -> Vec<&str> {
        self.skipped.iter().map(|s| s.path.as_str()).collect()
    }

    /// Keys whose compensating removal failed and are now unreferenced.
    pub fn orphaned_keys(&self) -> Vec<&str> {
        self.compensations
            .iter()
            .filter(|c| !c.removed)
            .map(|c| c.key.as_str())
            .collect()
    }
}

impl Serialize for IngestionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("IngestionResult", 3)?;
        state.serialize_field("uploaded", &self.uploaded)?;
        state.serialize_field("skipped", &self.skipped_paths())?;
        state.serialize_field("skip_reasons", &self.skipped)?;
        state.end()
    }
}
