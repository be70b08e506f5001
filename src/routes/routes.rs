//! Defines routes for the file gateway.
//!
//! ## Structure
//! - **Whole files**
//!   - `POST   /api/v1/files` upload one file
//!   - `GET    /api/v1/files/{id}` record metadata
//!   - `GET    /api/v1/files/{id}/download` stream, with `Range` support
//!   - `GET    /api/v1/files/bucket/{bucket}` live records of a bucket
//!   - `DELETE /api/v1/files/{id}` soft delete
//!   - `DELETE /api/v1/files/{id}/hard-delete` remove object and record
//!
//! - **Archives**
//!   - `POST   /api/v1/files/archive` upload a zip/7z and import its entries
//!
//! - **Chunked uploads** (`init` then one `chunk` call per part)
//!   - `POST   /api/v1/files/multipart/{init,chunk}`
//!   - `POST   /api/v1/files/archive/multipart/{init,chunk}`

use crate::{
    handlers::{
        file_handlers::{
            delete_file, download_file, get_file, hard_delete_file, list_bucket, upload_archive,
            upload_file,
        },
        health_handlers::{healthz, readyz},
        upload_handlers::{
            init_archive_upload, init_file_upload, put_archive_chunk, put_file_chunk,
        },
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. The shared `FileService` state is attached by the
/// caller with `with_state`.
pub fn routes(max_body_bytes: usize) -> Router<FileService> {
    let files = Router::new()
        .route("/", post(upload_file))
        .route("/archive", post(upload_archive))
        .route("/multipart/init", post(init_file_upload))
        .route("/multipart/chunk", post(put_file_chunk))
        .route("/archive/multipart/init", post(init_archive_upload))
        .route("/archive/multipart/chunk", post(put_archive_chunk))
        .route("/bucket/{bucket}", get(list_bucket))
        .route("/{id}", get(get_file).delete(delete_file))
        .route("/{id}/download", get(download_file))
        .route("/{id}/hard-delete", delete(hard_delete_file));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/v1/files", files)
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
