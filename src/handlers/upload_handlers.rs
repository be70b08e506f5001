//! Chunked upload endpoints. Plain and archive sessions share one flow and
//! differ only in what the merged artifact becomes.

use crate::{
    errors::AppError,
    handlers::form::{FilePayload, FileSink, Form, request_base_url},
    models::{response::ApiResponse, upload_session::{SessionId, UploadKind}},
    services::file_service::{ChunkReply, FileService},
};
use axum::{
    extract::{Multipart, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct InitReply {
    pub upload_id: SessionId,
}

/// `POST /api/v1/files/multipart/init`
pub async fn init_file_upload(
    State(service): State<FileService>,
    multipart: Multipart,
) -> Result<ApiResponse<InitReply>, AppError> {
    init_session(service, UploadKind::File, multipart).await
}

/// `POST /api/v1/files/archive/multipart/init`
pub async fn init_archive_upload(
    State(service): State<FileService>,
    multipart: Multipart,
) -> Result<ApiResponse<InitReply>, AppError> {
    init_session(service, UploadKind::Archive, multipart).await
}

/// `POST /api/v1/files/multipart/chunk`
pub async fn put_file_chunk(
    State(service): State<FileService>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    put_chunk(service, UploadKind::File, headers, multipart).await
}

/// `POST /api/v1/files/archive/multipart/chunk`
pub async fn put_archive_chunk(
    State(service): State<FileService>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    put_chunk(service, UploadKind::Archive, headers, multipart).await
}

async fn init_session(
    service: FileService,
    kind: UploadKind,
    multipart: Multipart,
) -> Result<ApiResponse<InitReply>, AppError> {
    let form = Form::read(multipart, "file", FileSink::Memory).await?;
    let bucket = form.required("bucket")?;
    let filename = form.required("filename")?;
    let mime_hint = form.text("mime_type").map(str::to_string);

    let upload_id = service
        .init_session(kind, bucket, filename, mime_hint)
        .await?;
    Ok(ApiResponse::with_msg("init success", InitReply { upload_id }))
}

async fn put_chunk(
    service: FileService,
    kind: UploadKind,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = Form::read(multipart, "chunk", FileSink::Memory).await?;
    let upload_id: SessionId = form
        .required("upload_id")?
        .parse()
        .map_err(|_| AppError::bad_request("invalid upload session"))?;
    let index: u32 = form.parsed("chunk_index")?;
    let total: u32 = form.parsed("total_chunks")?;
    let FilePayload::Buffered(data) = form.take_file("chunk")?.payload else {
        return Err(AppError::internal("chunk part was not buffered"));
    };

    let base_url = service.base_url(|| request_base_url(&headers));
    let reply = service
        .put_chunk(kind, upload_id, index, total, data, &base_url)
        .await?;

    Ok(match reply {
        ChunkReply::Progress(progress) => {
            ApiResponse::with_msg("chunk received", progress).into_response()
        }
        ChunkReply::Stored(record) => ApiResponse::with_msg("upload success", record).into_response(),
        ChunkReply::Ingested(result) => {
            ApiResponse::with_msg("archive processed", result).into_response()
        }
    })
}
