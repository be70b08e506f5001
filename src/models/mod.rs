//! Core data models for the file gateway.
//!
//! `FileRecord` maps to the `files` table via `sqlx::FromRow`; the rest are
//! transient request/response shapes serialized as JSON via `serde`.

pub mod file_record;
pub mod ingestion;
pub mod response;
pub mod upload_session;
