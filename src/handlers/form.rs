//! Multipart form reading and request-derived URLs shared by the handlers.

use crate::{
    errors::AppError,
    services::artifact::{Artifact, ArtifactWriter},
};
use axum::{
    extract::{Multipart, multipart::MultipartError},
    http::{HeaderMap, header},
};
use bytes::{Bytes, BytesMut};
use std::{collections::HashMap, path::Path, str::FromStr};

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

/// Where the file part of a form ends up.
#[derive(Clone, Copy)]
pub enum FileSink<'a> {
    /// Spooled into a scratch artifact; for whole files and archives.
    Scratch(&'a Path),
    /// Held in memory; for chunks.
    Memory,
}

pub enum FilePayload {
    Spooled(Artifact),
    Buffered(Bytes),
}

pub struct FilePart {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub payload: FilePayload,
}

/// Text fields plus at most one file part.
#[derive(Default)]
pub struct Form {
    fields: HashMap<String, String>,
    file: Option<FilePart>,
}

impl Form {
    /// Read every field of `multipart`. The part named `file_field` is
    /// treated as the payload and sent to `sink`; all others are text.
    pub async fn read(
        mut multipart: Multipart,
        file_field: &str,
        sink: FileSink<'_>,
    ) -> Result<Self, AppError> {
        let mut form = Form::default();
        while let Some(mut field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name != file_field {
                let value = field.text().await?;
                form.fields.insert(name, value);
                continue;
            }

            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let payload = match sink {
                FileSink::Scratch(scratch_dir) => {
                    let mut writer = ArtifactWriter::create(scratch_dir)
                        .await
                        .map_err(|e| AppError::internal(e.to_string()))?;
                    while let Some(chunk) = field.chunk().await? {
                        writer
                            .write(&chunk)
                            .await
                            .map_err(|e| AppError::internal(e.to_string()))?;
                    }
                    let artifact = writer
                        .finish()
                        .await
                        .map_err(|e| AppError::internal(e.to_string()))?;
                    FilePayload::Spooled(artifact)
                }
                FileSink::Memory => {
                    let mut buf = BytesMut::new();
                    while let Some(chunk) = field.chunk().await? {
                        buf.extend_from_slice(&chunk);
                    }
                    FilePayload::Buffered(buf.freeze())
                }
            };
            form.file = Some(FilePart {
                filename,
                content_type,
                payload,
            });
        }
        Ok(form)
    }

    /// Trimmed, non-empty text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, name: &str) -> Result<&str, AppError> {
        self.text(name)
            .ok_or_else(|| AppError::bad_request(format!("missing form field `{}`", name)))
    }

    pub fn parsed<T: FromStr>(&self, name: &str) -> Result<T, AppError> {
        let raw = self.required(name)?;
        raw.parse()
            .map_err(|_| AppError::bad_request(format!("invalid `{}`: `{}`", name, raw)))
    }

    pub fn take_file(&mut self, name: &str) -> Result<FilePart, AppError> {
        self.file
            .take()
            .ok_or_else(|| AppError::bad_request(format!("missing file part `{}`", name)))
    }
}

/// `{scheme}://{host}` as the client sees this server: forwarded headers
/// first, then `Host`.
pub fn request_base_url(headers: &HeaderMap) -> String {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let scheme = first("x-forwarded-proto").unwrap_or_else(|| "http".into());
    let host = first("x-forwarded-host")
        .or_else(|| first(header::HOST.as_str()))
        .unwrap_or_else(|| "localhost".into());
    format!("{}://{}", scheme, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn base_url_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8080"));
        assert_eq!(request_base_url(&headers), "http://internal:8080");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("files.example.com"));
        assert_eq!(request_base_url(&headers), "https://files.example.com");
    }

    #[test]
    fn base_url_without_headers() {
        assert_eq!(request_base_url(&HeaderMap::new()), "http://localhost");
    }
}
