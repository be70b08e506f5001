//! src/services/file_service.rs
//!
//! FileService: the gateway's single entry point. Wires the object store,
//! the metadata catalog, upload sessions, archive ingestion and range
//! retrieval together, and is the router state shared by every handler.

use crate::{
    models::{
        file_record::{FileRecord, FileRecordUpdate, NewFileRecord},
        ingestion::IngestionResult,
        upload_session::{ChunkProgress, SessionId, UploadKind},
    },
    services::{
        admission::AdmissionPolicy,
        artifact::Artifact,
        extractor::Extractor,
        ingestion::{ArchiveIngestor, IngestError, IngestTarget, compensate, materialize_url},
        metadata_store::{MetadataError, MetadataStore},
        naming::object_key_for,
        object_store::{ByteStream, ObjectStore, ObjectStoreError},
        retrieval::{Download, RangeRetriever, RetrievalError},
        sniffer::{OCTET_STREAM, safe_content_type},
        upload_sessions::{ChunkOutcome, SessionError, UploadSessionManager},
    },
};
use bytes::Bytes;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FileServiceResult<T> = Result<T, FileServiceError>;

/// Tunables the service needs from the application config.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub scratch_dir: PathBuf,
    /// Overrides the request-derived base of download URLs.
    pub public_base_url: Option<String>,
    pub max_path_depth: usize,
}

/// Reply to one chunk submission.
#[derive(Debug)]
pub enum ChunkReply {
    Progress(ChunkProgress),
    Stored(FileRecord),
    Ingested(IngestionResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDelete {
    Deleted,
    AlreadyDeleted,
}

/// An upload as the client described it.
pub struct UploadRequest<'a> {
    pub bucket: &'a str,
    pub filename: &'a str,
    /// Content type declared by the client, if any.
    pub content_type: Option<&'a str>,
}

#[derive(Clone)]
pub struct FileService {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    sessions: UploadSessionManager,
    ingestor: ArchiveIngestor,
    retriever: RangeRetriever,
    scratch_dir: PathBuf,
    public_base_url: Option<String>,
}

impl FileService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        extractor: Arc<dyn Extractor>,
        options: ServiceOptions,
    ) -> Self {
        let ingestor = ArchiveIngestor::new(
            objects.clone(),
            metadata.clone(),
            extractor,
            AdmissionPolicy::with_max_depth(options.max_path_depth),
            &options.scratch_dir,
        );
        Self {
            sessions: UploadSessionManager::local(&options.scratch_dir),
            retriever: RangeRetriever::new(objects.clone(), metadata.clone()),
            objects,
            metadata,
            ingestor,
            scratch_dir: options.scratch_dir,
            public_base_url: options
                .public_base_url
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Configured base URL, else `derived` (computed from the request).
    pub fn base_url(&self, derived: impl FnOnce() -> String) -> String {
        self.public_base_url.clone().unwrap_or_else(derived)
    }

    /// Store one object and catalog it. If the record cannot be written the
    /// object is removed again.
    pub async fn upload_stream(
        &self,
        request: &UploadRequest<'_>,
        stream: ByteStream,
        length: Option<u64>,
        base_url: &str,
    ) -> FileServiceResult<FileRecord> {
        let bucket = request.bucket;
        self.objects.ensure_bucket(bucket).await?;

        let key = object_key_for(request.filename);
        let content_type = content_type_for(request.content_type, request.filename);
        let stored = self
            .objects
            .put(bucket, &key, stream, length, &content_type)
            .await?;

        let new_record = NewFileRecord {
            bucket: bucket.to_string(),
            object_key: stored.key.clone(),
            original_name: Some(request.filename.to_string()),
            size_bytes: Some(stored.size as i64),
            mime_type: Some(content_type),
        };
        let mut record = match self.metadata.create(new_record).await {
            Ok(record) => record,
            Err(err) => {
                compensate(self.objects.as_ref(), bucket, &stored.key).await;
                return Err(err.into());
            }
        };
        materialize_url(self.metadata.as_ref(), &mut record, base_url).await;

        info!(id = record.id, bucket, key = %record.object_key, size = stored.size, "file stored");
        Ok(record)
    }

    /// Store a scratch artifact as a single object.
    pub async fn upload_artifact(
        &self,
        request: &UploadRequest<'_>,
        artifact: Artifact,
        base_url: &str,
    ) -> FileServiceResult<FileRecord> {
        let file = File::open(artifact.path()).await?;
        let stream: ByteStream = Box::pin(ReaderStream::new(file));
        let size = artifact.size();
        let record = self.upload_stream(request, stream, Some(size), base_url).await;
        drop(artifact);
        record
    }

    pub async fn ingest_artifact(
        &self,
        bucket: &str,
        filename: &str,
        artifact: &Artifact,
        base_url: &str,
    ) -> FileServiceResult<IngestionResult> {
        let target = IngestTarget { bucket, base_url };
        Ok(self
            .ingestor
            .ingest(artifact.path(), filename, &target)
            .await?)
    }

    pub async fn init_session(
        &self,
        kind: UploadKind,
        bucket: &str,
        filename: &str,
        mime_hint: Option<String>,
    ) -> FileServiceResult<SessionId> {
        Ok(self
            .sessions
            .init_session(kind, bucket, filename, mime_hint)
            .await?)
    }

    /// Accept one chunk. The final chunk hands the merged artifact to plain
    /// storage or to archive ingestion, depending on the session kind.
    pub async fn put_chunk(
        &self,
        kind: UploadKind,
        id: SessionId,
        index: u32,
        total: u32,
        data: Bytes,
        base_url: &str,
    ) -> FileServiceResult<ChunkReply> {
        let upload = match self.sessions.put_chunk(id, kind, index, total, data).await? {
            ChunkOutcome::Partial(progress) => return Ok(ChunkReply::Progress(progress)),
            ChunkOutcome::Assembled(upload) => upload,
        };
        let session = &upload.session;

        match session.kind {
            UploadKind::File => {
                let request = UploadRequest {
                    bucket: &session.bucket,
                    filename: &session.filename,
                    content_type: session.mime_hint.as_deref(),
                };
                let record = self
                    .upload_artifact(&request, upload.artifact, base_url)
                    .await?;
                Ok(ChunkReply::Stored(record))
            }
            UploadKind::Archive => {
                let result = self
                    .ingest_artifact(&session.bucket, &session.filename, &upload.artifact, base_url)
                    .await?;
                Ok(ChunkReply::Ingested(result))
            }
        }
    }

    /// Expire chunked uploads that saw no chunk for `max_idle`.
    pub async fn sweep_idle_sessions(&self, max_idle: Duration) -> usize {
        self.sessions.sweep_idle(max_idle).await
    }

    pub async fn get_record(&self, id: i64) -> FileServiceResult<FileRecord> {
        Ok(self.metadata.find(id).await?)
    }

    /// Live records of `bucket`, newest first, with URLs derived from
    /// `base_url`.
    pub async fn list_bucket(&self, bucket: &str, base_url: &str) -> FileServiceResult<Vec<FileRecord>> {
        let mut records = self.metadata.list_by_bucket(bucket).await?;
        for record in &mut records {
            record.url = FileRecord::download_url(base_url, record.id);
        }
        Ok(records)
    }

    pub async fn soft_delete(&self, id: i64) -> FileServiceResult<SoftDelete> {
        let record = self.metadata.find(id).await?;
        if record.is_deleted {
            return Ok(SoftDelete::AlreadyDeleted);
        }
        self.metadata.update(id, FileRecordUpdate::deleted()).await?;
        info!(id, bucket = %record.bucket, key = %record.object_key, "file soft-deleted");
        Ok(SoftDelete::Deleted)
    }

    /// Remove the object, then the record. An object that is already gone
    /// does not block removal of the record.
    pub async fn hard_delete(&self, id: i64) -> FileServiceResult<()> {
        let record = self.metadata.find(id).await?;
        match self.objects.remove(&record.bucket, &record.object_key).await {
            Ok(()) => {}
            Err(ObjectStoreError::ObjectNotFound { .. }) => {
                warn!(id, bucket = %record.bucket, key = %record.object_key, "object already missing");
            }
            Err(err) => return Err(err.into()),
        }
        self.metadata.delete(id).await?;
        info!(id, bucket = %record.bucket, key = %record.object_key, "file hard-deleted");
        Ok(())
    }

    pub async fn download(&self, id: i64, range: Option<&str>) -> FileServiceResult<Download> {
        Ok(self.retriever.open(id, range).await?)
    }
}

/// Declared type if usable, else a guess from the file extension, else the
/// generic binary type. Always sanitised.
fn content_type_for(declared: Option<&str>, filename: &str) -> String {
    let declared = declared.map(str::trim).filter(|ct| !ct.is_empty());
    match declared {
        Some(ct) => safe_content_type(ct),
        None => mime_guess::from_path(filename)
            .first_raw()
            .map(safe_content_type)
            .unwrap_or_else(|| OCTET_STREAM.to_string()),
    }
}
