//! Gateway services: the two storage collaborators, the ingestion core and
//! the `FileService` facade the HTTP layer talks to.

pub mod admission;
pub mod artifact;
pub mod extractor;
pub mod file_service;
pub mod ingestion;
pub mod metadata_store;
pub mod naming;
pub mod object_store;
pub mod retrieval;
pub mod sniffer;
pub mod upload_sessions;
