//! src/services/object_store.rs
//!
//! Object Store collaborator: put/get/stat/remove by bucket + key, with
//! byte-range reads. `DiskObjectStore` keeps payloads on local disk sharded
//! beneath `base_path/{bucket}/{shard}/{shard}/{key}` and a small JSON sidecar
//! per object under `base_path/{bucket}/.meta/` carrying its content type.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Stream of bytes for object content.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("declared length {expected} but received {actual} bytes")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("object sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Inclusive byte span requested from `get`. `end = None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    pub content_type: Option<String>,
}

/// Object storage operations consumed by the gateway.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool>;

    async fn create_bucket(&self, bucket: &str) -> ObjectStoreResult<()>;

    /// Store `stream` under `key`. When `length` is given the stream must
    /// produce exactly that many bytes or nothing is bound to the key.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        length: Option<u64>,
        content_type: &str,
    ) -> ObjectStoreResult<PutResult>;

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ObjectRange>,
    ) -> ObjectStoreResult<ByteStream>;

    async fn stat(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat>;

    async fn remove(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        if !self.bucket_exists(bucket).await? {
            self.create_bucket(bucket).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DiskObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SIDECAR_DIR: &str = ".meta";

impl DiskObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> ObjectStoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") || key.contains('/') {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> ObjectStoreResult<()> {
        let invalid = |reason: &str| ObjectStoreError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key)
    /// as lowercase hex.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        self.bucket_root(bucket).join(shard_a).join(shard_b).join(key)
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        self.bucket_root(bucket)
            .join(SIDECAR_DIR)
            .join(shard_a)
            .join(shard_b)
            .join(format!("{}.json", key))
    }

    async fn validate(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_key_safe(key)?;
        if !fs::try_exists(self.bucket_root(bucket)).await? {
            return Err(ObjectStoreError::BucketNotFound(bucket.to_string()));
        }
        Ok(())
    }

    fn not_found(bucket: &str, key: &str) -> impl FnOnce(io::Error) -> ObjectStoreError {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        move |err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound { bucket, key }
            } else {
                ObjectStoreError::Io(err)
            }
        }
    }

    /// Stream into a temp file beside the final location, fsync, then rename.
    /// Returns the number of bytes written.
    async fn write_atomically(
        &self,
        final_path: &Path,
        mut stream: ByteStream,
        length: Option<u64>,
    ) -> ObjectStoreResult<u64> {
        let parent = final_path.parent().ok_or_else(|| {
            ObjectStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written: ObjectStoreResult<u64> = async {
            let mut size: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            if let Some(expected) = length {
                if expected != size {
                    return Err(ObjectStoreError::LengthMismatch {
                        expected,
                        actual: size,
                    });
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(size)
        }
        .await;

        let size = match written {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        Ok(size)
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        self.ensure_bucket_name_safe(bucket)?;
        Ok(fs::try_exists(self.bucket_root(bucket)).await?)
    }

    async fn create_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        debug!(bucket, "bucket created");
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        length: Option<u64>,
        content_type: &str,
    ) -> ObjectStoreResult<PutResult> {
        self.validate(bucket, key).await?;

        let file_path = self.object_path(bucket, key);
        let size = self.write_atomically(&file_path, stream, length).await?;

        let stat = ObjectStat {
            size,
            content_type: Some(content_type.to_string()),
        };
        let sidecar = Bytes::from(serde_json::to_vec(&stat)?);
        let sidecar_path = self.sidecar_path(bucket, key);
        let sidecar_stream: ByteStream = Box::pin(futures::stream::once(async { Ok(sidecar) }));
        if let Err(err) = self.write_atomically(&sidecar_path, sidecar_stream, None).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        debug!(bucket, key, size, "object stored");
        Ok(PutResult {
            key: key.to_string(),
            size,
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ObjectRange>,
    ) -> ObjectStoreResult<ByteStream> {
        self.validate(bucket, key).await?;
        let mut file = File::open(self.object_path(bucket, key))
            .await
            .map_err(Self::not_found(bucket, key))?;

        let Some(range) = range else {
            return Ok(Box::pin(ReaderStream::new(file)));
        };
        file.seek(SeekFrom::Start(range.start)).await?;
        match range.end {
            Some(end) => {
                let limit = end.saturating_sub(range.start) + 1;
                Ok(Box::pin(ReaderStream::new(file.take(limit))))
            }
            None => Ok(Box::pin(ReaderStream::new(file))),
        }
    }

    async fn stat(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat> {
        self.validate(bucket, key).await?;
        let meta = fs::metadata(self.object_path(bucket, key))
            .await
            .map_err(Self::not_found(bucket, key))?;

        let content_type = match fs::read(self.sidecar_path(bucket, key)).await {
            Ok(raw) => serde_json::from_slice::<ObjectStat>(&raw)?.content_type,
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(ObjectStoreError::Io(err)),
        };

        Ok(ObjectStat {
            size: meta.len(),
            content_type,
        })
    }

    async fn remove(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.validate(bucket, key).await?;
        let bucket_root = self.bucket_root(bucket);

        let file_path = self.object_path(bucket, key);
        fs::remove_file(&file_path)
            .await
            .map_err(Self::not_found(bucket, key))?;
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        let sidecar_path = self.sidecar_path(bucket, key);
        match fs::remove_file(&sidecar_path).await {
            Ok(_) => {
                if let Some(parent) = sidecar_path.parent() {
                    self.prune_empty_dirs(parent, &bucket_root).await;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove sidecar {}: {}", sidecar_path.display(), err),
        }

        debug!(bucket, key, "object removed");
        Ok(())
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

/// Wrap an in-memory buffer as a `ByteStream`.
#[cfg(test)]
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a `ByteStream` into one buffer.
#[cfg(test)]
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
