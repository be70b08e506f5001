//! Range-addressable downloads.
//!
//! Only a single `bytes=start-end` or `bytes=start-` span is understood.
//! The range is validated before anything is read from the object store.

use crate::{
    models::file_record::FileRecord,
    services::{
        metadata_store::{MetadataError, MetadataStore},
        object_store::{ByteStream, ObjectRange, ObjectStore, ObjectStoreError},
        sniffer::{OCTET_STREAM, safe_content_type},
    },
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("malformed range `{0}`")]
    Malformed(String),
    #[error("multiple ranges are not supported")]
    MultiRange,
    #[error("range end {end} precedes start {start}")]
    Inverted { start: u64, end: u64 },
    #[error("object size unknown, open-ended range cannot be resolved")]
    UnknownSize,
    #[error("range start {start} is beyond object size {size}")]
    Unsatisfiable { start: u64, size: u64 },
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("file `{0}` not found")]
    NotFound(i64),
    #[error("file `{0}` has been deleted")]
    Gone(i64),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Metadata(MetadataError),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

impl From<MetadataError> for RetrievalError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(id) => RetrievalError::NotFound(id),
            other => RetrievalError::Metadata(other),
        }
    }
}

/// A requested span as written by the client, before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// The inclusive span actually served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServedRange {
    pub start: u64,
    pub end: u64,
    /// Total object size, when known.
    pub size: Option<u64>,
}

impl ServedRange {
    /// Payload length. `resolve_range` only builds spans where this fits.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header.
    pub fn content_range(&self) -> String {
        match self.size {
            Some(size) => format!("bytes {}-{}/{}", self.start, self.end, size),
            None => format!("bytes {}-{}/*", self.start, self.end),
        }
    }
}

const BYTES_UNIT: &str = "bytes=";

/// Parse a `Range` header value. The unit is matched case-insensitively.
pub fn parse_range(header: &str) -> Result<RequestedRange, RangeError> {
    let malformed = || RangeError::Malformed(header.to_string());
    let trimmed = header.trim();
    let spec = match trimmed.get(..BYTES_UNIT.len()) {
        Some(unit) if unit.eq_ignore_ascii_case(BYTES_UNIT) => trimmed[BYTES_UNIT.len()..].trim(),
        _ => return Err(malformed()),
    };
    if spec.contains(',') {
        return Err(RangeError::MultiRange);
    }
    let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
    let (start, end) = (start.trim(), end.trim());
    // suffix ranges (`bytes=-N`) land here too
    if start.is_empty() || !start.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let start: u64 = start.parse().map_err(|_| malformed())?;

    let end = if end.is_empty() {
        None
    } else {
        if !end.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let end: u64 = end.parse().map_err(|_| malformed())?;
        if end < start {
            return Err(RangeError::Inverted { start, end });
        }
        Some(end)
    };
    Ok(RequestedRange { start, end })
}

/// Clamp `requested` against the object size.
pub fn resolve_range(requested: RequestedRange, size: Option<u64>) -> Result<ServedRange, RangeError> {
    let RequestedRange { start, end } = requested;
    match (size, end) {
        (None, None) => Err(RangeError::UnknownSize),
        (None, Some(end)) => {
            // the span length must fit in a u64 Content-Length
            if end.checked_sub(start).and_then(|span| span.checked_add(1)).is_none() {
                return Err(RangeError::Malformed(format!("bytes={}-{}", start, end)));
            }
            Ok(ServedRange {
                start,
                end,
                size: None,
            })
        }
        (Some(size), _) if start >= size => Err(RangeError::Unsatisfiable { start, size }),
        (Some(size), end) => Ok(ServedRange {
            start,
            end: end.map_or(size - 1, |end| end.min(size - 1)),
            size: Some(size),
        }),
    }
}

/// Everything needed to answer a download request.
pub struct Download {
    pub record: FileRecord,
    pub content_type: String,
    /// `None` for a full download.
    pub range: Option<ServedRange>,
    /// Exact body length when known.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

#[derive(Clone)]
pub struct RangeRetriever {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl RangeRetriever {
    pub fn new(objects: Arc<dyn ObjectStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { objects, metadata }
    }

    pub async fn open(&self, id: i64, range_header: Option<&str>) -> Result<Download, RetrievalError> {
        let record = self.metadata.find(id).await?;
        if record.is_deleted {
            return Err(RetrievalError::Gone(id));
        }
        let requested = range_header.map(parse_range).transpose()?;

        let (size, stored_type) = match self.objects.stat(&record.bucket, &record.object_key).await {
            Ok(stat) => (Some(stat.size), stat.content_type),
            Err(ObjectStoreError::ObjectNotFound { .. }) => return Err(RetrievalError::NotFound(id)),
            Err(err) => {
                debug!(id, bucket = %record.bucket, key = %record.object_key, "stat failed: {}", err);
                (None, None)
            }
        };
        let content_type = stored_type
            .or_else(|| record.mime_type.clone())
            .map(|ct| safe_content_type(&ct))
            .unwrap_or_else(|| OCTET_STREAM.to_string());

        let Some(requested) = requested else {
            let body = self
                .objects
                .get(&record.bucket, &record.object_key, None)
                .await?;
            return Ok(Download {
                record,
                content_type,
                range: None,
                content_length: size,
                body,
            });
        };

        let served = resolve_range(requested, size)?;
        let body = self
            .objects
            .get(
                &record.bucket,
                &record.object_key,
                Some(ObjectRange {
                    start: served.start,
                    end: Some(served.end),
                }),
            )
            .await?;
        Ok(Download {
            record,
            content_type,
            content_length: Some(served.len()),
            range: Some(served),
            body,
        })
    }
}
