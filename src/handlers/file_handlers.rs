//! HTTP handlers for whole-file uploads, archive uploads, metadata and
//! downloads. Download bodies are streamed, never buffered.

use crate::{
    errors::AppError,
    handlers::form::{FilePayload, FileSink, Form, request_base_url},
    models::{file_record::FileRecord, ingestion::IngestionResult, response::ApiResponse},
    services::{
        file_service::{FileService, SoftDelete, UploadRequest},
        retrieval::Download,
    },
};
use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};

/// `POST /api/v1/files`: multipart `bucket` + `file`.
pub async fn upload_file(
    State(service): State<FileService>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<ApiResponse<FileRecord>, AppError> {
    let mut form = Form::read(multipart, "file", FileSink::Scratch(service.scratch_dir())).await?;
    let bucket = form.required("bucket")?.to_string();
    let part = form.take_file("file")?;
    let FilePayload::Spooled(artifact) = part.payload else {
        return Err(AppError::internal("file part was not spooled"));
    };
    let filename = part.filename.unwrap_or_default();

    let request = UploadRequest {
        bucket: &bucket,
        filename: &filename,
        content_type: part.content_type.as_deref(),
    };
    let base_url = service.base_url(|| request_base_url(&headers));
    let record = service
        .upload_artifact(&request, artifact, &base_url)
        .await?;
    Ok(ApiResponse::with_msg("upload success", record))
}

/// `POST /api/v1/files/archive`: multipart `bucket` + `file` (zip or 7z).
pub async fn upload_archive(
    State(service): State<FileService>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<ApiResponse<IngestionResult>, AppError> {
    let mut form = Form::read(multipart, "file", FileSink::Scratch(service.scratch_dir())).await?;
    let bucket = form.required("bucket")?.to_string();
    let part = form.take_file("file")?;
    let FilePayload::Spooled(artifact) = part.payload else {
        return Err(AppError::internal("file part was not spooled"));
    };
    let filename = part.filename.unwrap_or_default();

    let base_url = service.base_url(|| request_base_url(&headers));
    let result = service
        .ingest_artifact(&bucket, &filename, &artifact, &base_url)
        .await?;
    Ok(ApiResponse::with_msg("archive processed", result))
}

/// `GET /api/v1/files/{id}`
pub async fn get_file(
    State(service): State<FileService>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<FileRecord>, AppError> {
    let record = service.get_record(id).await?;
    Ok(ApiResponse::success(record))
}

/// `GET /api/v1/files/bucket/{bucket}`: live records, newest first.
pub async fn list_bucket(
    State(service): State<FileService>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<ApiResponse<Vec<FileRecord>>, AppError> {
    let base_url = service.base_url(|| request_base_url(&headers));
    let records = service.list_bucket(&bucket, &base_url).await?;
    Ok(ApiResponse::success(records))
}

/// `DELETE /api/v1/files/{id}`: soft delete.
pub async fn delete_file(
    State(service): State<FileService>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<()>, AppError> {
    let msg = match service.soft_delete(id).await? {
        SoftDelete::Deleted => "deleted",
        SoftDelete::AlreadyDeleted => "already deleted",
    };
    Ok(ApiResponse::message(msg))
}

/// `DELETE /api/v1/files/{id}/hard-delete`: object and record.
pub async fn hard_delete_file(
    State(service): State<FileService>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<()>, AppError> {
    service.hard_delete(id).await?;
    Ok(ApiResponse::message("hard deleted"))
}

/// `GET /api/v1/files/{id}/download`: honours a single `Range`.
pub async fn download_file(
    State(service): State<FileService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, "malformed range"))
        })
        .transpose()?;

    let download = service.download(id, range).await?;
    Ok(download_response(download))
}

fn download_response(download: Download) -> Response {
    let Download {
        record,
        content_type,
        range,
        content_length,
        body,
    } = download;

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&record),
    );
    if let Some(length) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(range) = range {
        if let Ok(value) = HeaderValue::from_str(&range.content_range()) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    } else {
        *response.status_mut() = StatusCode::OK;
    }
    response
}

/// `attachment; filename="..."` with quotes, backslashes and control
/// characters kept out of the header.
fn content_disposition(record: &FileRecord) -> HeaderValue {
    let name: String = record
        .display_name()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)).unwrap_or_else(|_| {
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", record.object_key))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(name: Option<&str>) -> FileRecord {
        FileRecord {
            id: 3,
            bucket: "b".into(),
            object_key: "0d3c.txt".into(),
            original_name: name.map(str::to_string),
            url: String::new(),
            size_bytes: None,
            mime_type: None,
            is_deleted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn disposition_uses_display_name_or_key() {
        assert_eq!(
            content_disposition(&record(Some("report.txt"))),
            "attachment; filename=\"report.txt\""
        );
        assert_eq!(
            content_disposition(&record(None)),
            "attachment; filename=\"0d3c.txt\""
        );
        assert_eq!(
            content_disposition(&record(Some("a\"b\r\n.txt"))),
            "attachment; filename=\"a_b.txt\""
        );
    }
}
