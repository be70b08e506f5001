//! Archive ingestion: detect the container, admit shallow entries and turn
//! each one into a stored object plus a catalog record.
//!
//! Entries are independent. A bad entry lands in the skip list and the run
//! goes on; only a container that cannot be opened at all fails the run.

use crate::{
    models::{
        file_record::{FileRecord, FileRecordUpdate, NewFileRecord},
        ingestion::{Compensation, IngestionResult, SkipReason},
    },
    services::{
        admission::{Admission, AdmissionPolicy},
        extractor::{ExtractError, Extractor},
        metadata_store::MetadataStore,
        naming::object_key_for,
        object_store::{ObjectStore, ObjectStoreError},
        sniffer::{rejoin, sniff_reader},
    },
};
use bytes::Bytes;
use std::{
    fs::File as StdFile,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

/// Leading bytes of every 7z archive.
pub const SEVEN_ZIP_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

const ZIP_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported or corrupt archive: {0}")]
    UnsupportedArchive(String),
    #[error("archive extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("bucket `{bucket}` is unavailable: {source}")]
    Bucket {
        bucket: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    SevenZip,
}

/// Where an ingestion run writes and how it names things.
pub struct IngestTarget<'a> {
    pub bucket: &'a str,
    /// Base of the download URLs bound to new records.
    pub base_url: &'a str,
}

/// One candidate entry: the path exactly as the container spelled it.
struct ZipEntry {
    index: usize,
    name: String,
    is_dir: bool,
    size: u64,
}

struct TreeEntry {
    path: PathBuf,
    raw_path: String,
    size: u64,
}

#[derive(Clone)]
pub struct ArchiveIngestor {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    extractor: Arc<dyn Extractor>,
    policy: AdmissionPolicy,
    scratch_dir: PathBuf,
}

impl ArchiveIngestor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        extractor: Arc<dyn Extractor>,
        policy: AdmissionPolicy,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            objects,
            metadata,
            extractor,
            policy,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Ingest the archive at `artifact`. `filename` is the name the client
    /// declared for it; a `.7z` suffix selects the 7z path even without the
    /// magic bytes.
    pub async fn ingest(
        &self,
        artifact: &Path,
        filename: &str,
        target: &IngestTarget<'_>,
    ) -> Result<IngestionResult, IngestError> {
        self.objects
            .ensure_bucket(target.bucket)
            .await
            .map_err(|source| IngestError::Bucket {
                bucket: target.bucket.to_string(),
                source,
            })?;

        let result = match detect(artifact, filename).await? {
            (ArchiveKind::SevenZip, _) => self.ingest_seven_zip(artifact, target).await,
            (ArchiveKind::Zip, entries) => self.ingest_zip(artifact, entries, target).await,
        };

        match &result {
            Ok(result) => {
                info!(
                    bucket = target.bucket,
                    filename,
                    uploaded = result.uploaded.len(),
                    skipped = result.skipped.len(),
                    "archive ingested"
                );
                let orphaned = result.orphaned_keys();
                if !orphaned.is_empty() {
                    warn!(
                        bucket = target.bucket,
                        filename,
                        ?orphaned,
                        "archive ingestion left unreferenced objects"
                    );
                }
            }
            Err(err) => error!(bucket = target.bucket, filename, "archive ingestion failed: {}", err),
        }
        result
    }

    async fn ingest_zip(
        &self,
        artifact: &Path,
        entries: Vec<ZipEntry>,
        target: &IngestTarget<'_>,
    ) -> Result<IngestionResult, IngestError> {
        let mut result = IngestionResult::default();

        for entry in entries {
            if entry.is_dir {
                continue;
            }
            let Some(leaf) = self.admit(&entry.name, &mut result) else {
                continue;
            };
            let reader = open_zip_entry(artifact.to_path_buf(), entry.index);
            self.ingest_entry(&entry.name, &leaf, reader, entry.size, target, &mut result)
                .await;
        }
        Ok(result)
    }

    async fn ingest_seven_zip(
        &self,
        artifact: &Path,
        target: &IngestTarget<'_>,
    ) -> Result<IngestionResult, IngestError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let work_dir = {
            let scratch_dir = self.scratch_dir.clone();
            tokio::task::spawn_blocking(move || {
                tempfile::Builder::new()
                    .prefix("extract-")
                    .tempdir_in(scratch_dir)
            })
            .await
            .map_err(io::Error::other)??
        };

        debug!(extractor = self.extractor.name(), work_dir = %work_dir.path().display(), "extracting 7z archive");
        self.extractor.extract(artifact, work_dir.path()).await?;

        let entries = walk_tree(&work_dir, artifact).await?;
        let mut result = IngestionResult::default();
        for entry in entries {
            let Some(leaf) = self.admit(&entry.raw_path, &mut result) else {
                continue;
            };
            let reader = match File::open(&entry.path).await {
                Ok(file) => file,
                Err(err) => {
                    debug!(path = %entry.raw_path, "cannot open extracted entry: {}", err);
                    result.skip(entry.raw_path, SkipReason::OpenFailed);
                    continue;
                }
            };
            self.ingest_entry(&entry.raw_path, &leaf, reader, entry.size, target, &mut result)
                .await;
        }
        Ok(result)
    }

    fn admit(&self, raw_path: &str, result: &mut IngestionResult) -> Option<String> {
        match self.policy.admit(raw_path) {
            Admission::Accept { leaf } => Some(leaf),
            Admission::RejectEmpty => {
                debug!(path = raw_path, "skipping entry with an empty path");
                result.skip(raw_path, SkipReason::EmptyPath);
                None
            }
            Admission::RejectTooDeep { depth } => {
                debug!(path = raw_path, depth, "skipping entry nested too deep");
                result.skip(raw_path, SkipReason::TooDeep);
                None
            }
        }
    }

    /// STORE, RECORD and, when recording fails, COMPENSATE for one entry.
    async fn ingest_entry<R>(
        &self,
        raw_path: &str,
        leaf: &str,
        mut reader: R,
        size: u64,
        target: &IngestTarget<'_>,
        result: &mut IngestionResult,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sniffed = match sniff_reader(&mut reader).await {
            Ok(sniffed) => sniffed,
            Err(err) => {
                debug!(path = raw_path, "cannot read entry: {}", err);
                result.skip(raw_path, SkipReason::OpenFailed);
                return;
            }
        };

        let bucket = target.bucket;
        let key = object_key_for(leaf);
        let stream = rejoin(sniffed.prefix, reader);
        let stored = match self
            .objects
            .put(bucket, &key, stream, Some(size), &sniffed.content_type)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                debug!(path = raw_path, bucket, key = %key, "store failed: {}", err);
                result.skip(raw_path, SkipReason::StoreFailed);
                return;
            }
        };

        let new_record = NewFileRecord {
            bucket: bucket.to_string(),
            object_key: stored.key.clone(),
            original_name: Some(leaf.to_string()),
            size_bytes: Some(stored.size as i64),
            mime_type: Some(sniffed.content_type),
        };
        let mut record = match self.metadata.create(new_record).await {
            Ok(record) => record,
            Err(err) => {
                debug!(path = raw_path, bucket, key = %stored.key, "record failed: {}", err);
                let compensation = compensate(self.objects.as_ref(), bucket, &stored.key).await;
                result.compensations.push(compensation);
                result.skip(raw_path, SkipReason::RecordFailed);
                return;
            }
        };

        materialize_url(self.metadata.as_ref(), &mut record, target.base_url).await;
        result.uploaded.push(record);
    }
}

/// Best-effort removal of an object whose record could not be written.
pub(crate) async fn compensate(objects: &dyn ObjectStore, bucket: &str, key: &str) -> Compensation {
    let removed = match objects.remove(bucket, key).await {
        Ok(()) => true,
        Err(err) => {
            warn!(bucket, key, "orphaned object left behind: {}", err);
            false
        }
    };
    Compensation {
        bucket: bucket.to_string(),
        key: key.to_string(),
        removed,
    }
}

/// Persist the download URL for a fresh record. A failure leaves the record
/// in place with an empty URL.
pub(crate) async fn materialize_url(
    metadata: &dyn MetadataStore,
    record: &mut FileRecord,
    base_url: &str,
) {
    let url = FileRecord::download_url(base_url, record.id);
    match metadata.update(record.id, FileRecordUpdate::url(url.clone())).await {
        Ok(()) => record.url = url,
        Err(err) => warn!(id = record.id, "failed to persist download url: {}", err),
    }
}

/// Classify the artifact. Zip entries are listed during detection since
/// parsing the central directory is the zip check itself.
async fn detect(artifact: &Path, filename: &str) -> Result<(ArchiveKind, Vec<ZipEntry>), IngestError> {
    let mut head = [0u8; SEVEN_ZIP_MAGIC.len()];
    let mut file = File::open(artifact).await?;
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if head[..filled] == SEVEN_ZIP_MAGIC || filename.to_ascii_lowercase().ends_with(".7z") {
        return Ok((ArchiveKind::SevenZip, Vec::new()));
    }

    let path = artifact.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || list_zip(&path))
        .await
        .map_err(io::Error::other)?
        .map_err(|e| IngestError::UnsupportedArchive(e.to_string()))?;
    Ok((ArchiveKind::Zip, entries))
}

fn list_zip(path: &Path) -> zip::result::ZipResult<Vec<ZipEntry>> {
    let mut archive = ZipArchive::new(StdFile::open(path)?)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        entries.push(ZipEntry {
            index,
            name: entry.name().to_string(),
            is_dir: entry.is_dir(),
            size: entry.size(),
        });
    }
    Ok(entries)
}

/// Decompress one zip entry on the blocking pool, bridged into an async
/// reader. Open errors surface as the reader's first read error.
fn open_zip_entry(path: PathBuf, index: usize) -> impl AsyncRead + Unpin + Send + 'static {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);

    tokio::task::spawn_blocking(move || {
        let pump = || -> io::Result<()> {
            let mut archive = ZipArchive::new(StdFile::open(&path)?).map_err(io::Error::other)?;
            let mut entry = archive.by_index(index).map_err(io::Error::other)?;
            let mut buf = vec![0u8; ZIP_READ_CHUNK];
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    // reader went away
                    return Ok(());
                }
            }
        };
        if let Err(err) = pump() {
            let _ = tx.blocking_send(Err(err));
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    StreamReader::new(Box::pin(stream))
}

/// Every regular file under `work_dir` except the artifact itself, with the
/// relative path spelled with `/`.
async fn walk_tree(work_dir: &TempDir, artifact: &Path) -> Result<Vec<TreeEntry>, IngestError> {
    let root = work_dir.path().to_path_buf();
    let artifact = artifact.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() || entry.path() == artifact {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let raw_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata().map_err(io::Error::other)?.len();
            entries.push(TreeEntry {
                path: entry.path().to_path_buf(),
                raw_path,
                size,
            });
        }
        Ok::<_, io::Error>(entries)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(entries)
}
