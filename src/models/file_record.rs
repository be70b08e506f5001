//! Represents a file record, the catalog row bound to one stored object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted metadata for a single stored object.
///
/// The record is created right after its backing object is written and
/// afterwards only has its `url` or `is_deleted` field touched.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Store-assigned identity.
    pub id: i64,

    /// Bucket holding the object.
    pub bucket: String,

    /// Object key, unique within the bucket and immutable.
    pub object_key: String,

    /// Display name supplied by the uploader (or the archive entry leaf).
    pub original_name: Option<String>,

    /// Retrieval URL bound to `id`. Empty until materialized.
    pub url: String,

    /// Size in bytes.
    pub size_bytes: Option<i64>,

    /// Content type (MIME type).
    pub mime_type: Option<String>,

    /// Soft-delete marker. Deleted records are never served.
    pub is_deleted: bool,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Name to advertise in `Content-Disposition`, falling back to the key.
    pub fn display_name(&self) -> &str {
        match self.original_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.object_key,
        }
    }

    /// Download location for record `id` under `base_url`.
    pub fn download_url(base_url: &str, id: i64) -> String {
        format!(
            "{}/api/v1/files/{}/download",
            base_url.trim_end_matches('/'),
            id
        )
    }
}

/// Fields required to insert a new record.
#[derive(Clone, Debug)]
pub struct NewFileRecord {
    pub bucket: String,
    pub object_key: String,
    pub original_name: Option<String>,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
}

/// The only mutable fields of a record.
#[derive(Clone, Debug, Default)]
pub struct FileRecordUpdate {
    pub url: Option<String>,
    pub is_deleted: Option<bool>,
}

impl FileRecordUpdate {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            is_deleted: Some(true),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(original_name: Option<&str>) -> FileRecord {
        FileRecord {
            id: 1,
            bucket: "docs".into(),
            object_key: "3f1c.pdf".into(),
            original_name: original_name.map(str::to_string),
            url: String::new(),
            size_bytes: Some(10),
            mime_type: None,
            is_deleted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn display_name_falls_back_to_key() {
        assert_eq!(record(Some("report.pdf")).display_name(), "report.pdf");
        assert_eq!(record(Some("")).display_name(), "3f1c.pdf");
        assert_eq!(record(None).display_name(), "3f1c.pdf");
    }

    #[test]
    fn download_url_is_bound_to_id() {
        assert_eq!(
            FileRecord::download_url("https://files.example.com/", 42),
            "https://files.example.com/api/v1/files/42/download"
        );
    }
}
