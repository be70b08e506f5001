//! Represents in-flight chunked upload sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};
use uuid::Uuid;

/// Opaque identity handed to the client at session init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// What the assembled artifact becomes once merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// Stored as one object.
    File,
    /// Handed to the archive ingestion pipeline.
    Archive,
}

/// Lifecycle of a session. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Receiving,
    Merging,
    Completed,
    Failed,
}

/// State for one chunked transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub kind: UploadKind,

    /// Target bucket declared at init.
    pub bucket: String,

    /// Original filename declared at init.
    pub filename: String,

    /// MIME hint declared at init, if any.
    pub mime_hint: Option<String>,

    /// 1-based indices written so far.
    pub received: BTreeSet<u32>,

    /// Total declared by the first chunk.
    pub total_chunks: Option<u32>,

    pub state: SessionState,
    pub created_at: DateTime<Utc>,

    /// Bumped by every stored chunk; idle sessions are swept on this.
    pub last_activity: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        kind: UploadKind,
        bucket: impl Into<String>,
        filename: impl Into<String>,
        mime_hint: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            kind,
            bucket: bucket.into(),
            filename: filename.into(),
            mime_hint: mime_hint.filter(|m| !m.trim().is_empty()),
            received: BTreeSet::new(),
            total_chunks: None,
            state: SessionState::Receiving,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Progress reply for a non-final chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub received: u32,
    pub total: u32,
}
