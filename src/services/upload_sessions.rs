//! Resumable chunked uploads.
//!
//! Session state lives behind [`SessionStore`]; chunk bytes live behind
//! [`ChunkStore`]. Each chunk index has its own scratch slot, so writes for
//! different indices never contend. The move into `Merging` is a
//! compare-and-swap on the session state, which guarantees a single merge
//! even when the final chunk is delivered twice concurrently.

use crate::{
    models::upload_session::{ChunkProgress, SessionId, SessionState, UploadKind, UploadSession},
    services::{
        artifact::{Artifact, ArtifactWriter},
        object_store::ByteStream,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid upload session `{0}`")]
    InvalidSession(String),
    #[error("upload session `{0}` is already merging")]
    AlreadyMerging(SessionId),
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("merge failed: chunk {index} of {total} is missing")]
    MissingChunk { index: u32, total: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Session-id → session state.
pub trait SessionStore: Send + Sync {
    fn insert(&self, session: UploadSession);

    fn get(&self, id: SessionId) -> Option<UploadSession>;

    /// Record a written chunk. Fails unless the session is still receiving.
    fn record_chunk(&self, id: SessionId, index: u32, total: u32) -> SessionResult<()>;

    /// Atomically move `id` from `expected` to `next`. Returns false when the
    /// session is missing or in another state.
    fn compare_and_set(&self, id: SessionId, expected: SessionState, next: SessionState) -> bool;

    fn remove(&self, id: SessionId) -> Option<UploadSession>;

    /// Remove and return the receiving sessions whose last activity is at or
    /// before `cutoff`. Merging sessions are left to their merge.
    fn take_idle(&self, cutoff: DateTime<Utc>) -> Vec<UploadSession>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, UploadSession>>,
}

impl InMemorySessionStore {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, UploadSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, session: UploadSession) {
        self.sessions().insert(session.id, session);
    }

    fn get(&self, id: SessionId) -> Option<UploadSession> {
        self.sessions().get(&id).cloned()
    }

    fn record_chunk(&self, id: SessionId, index: u32, total: u32) -> SessionResult<()> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| SessionError::InvalidSession(id.to_string()))?;
        ensure_receiving(session)?;
        match session.total_chunks {
            Some(declared) if declared != total => {
                return Err(SessionError::InvalidChunk(format!(
                    "total_chunks {} does not match the declared {}",
                    total, declared
                )));
            }
            _ => session.total_chunks = Some(total),
        }
        session.received.insert(index);
        session.last_activity = Utc::now();
        Ok(())
    }

    fn compare_and_set(&self, id: SessionId, expected: SessionState, next: SessionState) -> bool {
        match self.sessions().get_mut(&id) {
            Some(session) if session.state == expected => {
                session.state = next;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, id: SessionId) -> Option<UploadSession> {
        self.sessions().remove(&id)
    }

    fn take_idle(&self, cutoff: DateTime<Utc>) -> Vec<UploadSession> {
        let mut sessions = self.sessions();
        let idle: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.state == SessionState::Receiving && s.last_activity <= cutoff)
            .map(|s| s.id)
            .collect();
        idle.iter().filter_map(|id| sessions.remove(id)).collect()
    }
}

fn ensure_receiving(session: &UploadSession) -> SessionResult<()> {
    match session.state {
        SessionState::Receiving => Ok(()),
        SessionState::Merging => Err(SessionError::AlreadyMerging(session.id)),
        SessionState::Completed | SessionState::Failed => {
            Err(SessionError::InvalidSession(session.id.to_string()))
        }
    }
}

/// Scratch storage for chunk payloads, one slot per (session, index).
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn allocate(&self, id: SessionId) -> io::Result<()>;

    async fn write_part(&self, id: SessionId, index: u32, data: Bytes) -> io::Result<()>;

    /// `None` when the part was never written.
    async fn open_part(&self, id: SessionId, index: u32) -> io::Result<Option<ByteStream>>;

    /// Remove every part of the session. Missing scratch is not an error.
    async fn purge(&self, id: SessionId) -> io::Result<()>;
}

/// Parts on local disk: `{root}/{session_id}/part_000001`, ...
#[derive(Clone, Debug)]
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, id: SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn part_path(&self, id: SessionId, index: u32) -> PathBuf {
        self.session_dir(id).join(format!("part_{:06}", index))
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn allocate(&self, id: SessionId) -> io::Result<()> {
        fs::create_dir_all(self.session_dir(id)).await
    }

    /// Written beside the slot, then renamed over it, so a reader never sees
    /// a half-written part even when the chunk is retried.
    async fn write_part(&self, id: SessionId, index: u32, data: Bytes) -> io::Result<()> {
        let part = self.part_path(id, index);
        let tmp = part.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        if let Err(err) = fs::write(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp, &part).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn open_part(&self, id: SessionId, index: u32) -> io::Result<Option<ByteStream>> {
        match File::open(self.part_path(id, index)).await {
            Ok(file) => Ok(Some(Box::pin(ReaderStream::new(file)))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn purge(&self, id: SessionId) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(id)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// The assembled artifact together with what the client declared at init.
#[derive(Debug)]
pub struct AssembledUpload {
    pub session: UploadSession,
    pub artifact: Artifact,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Partial(ChunkProgress),
    Assembled(AssembledUpload),
}

#[derive(Clone)]
pub struct UploadSessionManager {
    sessions: Arc<dyn SessionStore>,
    chunks: Arc<dyn ChunkStore>,
    /// Where merged artifacts are written.
    scratch_dir: PathBuf,
}

impl UploadSessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chunks: Arc<dyn ChunkStore>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sessions,
            chunks,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Sessions in memory, parts under `{scratch_dir}/sessions`.
    pub fn local(scratch_dir: impl Into<PathBuf>) -> Self {
        let scratch_dir = scratch_dir.into();
        Self::new(
            Arc::new(InMemorySessionStore::default()),
            Arc::new(LocalChunkStore::new(scratch_dir.join("sessions"))),
            scratch_dir,
        )
    }

    pub async fn init_session(
        &self,
        kind: UploadKind,
        bucket: &str,
        filename: &str,
        mime_hint: Option<String>,
    ) -> SessionResult<SessionId> {
        let session = UploadSession::new(kind, bucket, filename, mime_hint);
        let id = session.id;
        self.chunks.allocate(id).await?;
        self.sessions.insert(session);
        info!(session_id = %id, bucket, filename, ?kind, "upload session opened");
        Ok(id)
    }

    /// Store chunk `index` of `total`. The chunk whose index equals `total`
    /// triggers the merge; every other chunk returns progress.
    pub async fn put_chunk(
        &self,
        id: SessionId,
        kind: UploadKind,
        index: u32,
        total: u32,
        data: Bytes,
    ) -> SessionResult<ChunkOutcome> {
        if total == 0 || index == 0 || index > total {
            return Err(SessionError::InvalidChunk(format!(
                "chunk_index {} must be within 1..={}",
                index, total
            )));
        }

        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::InvalidSession(id.to_string()))?;
        if session.kind != kind {
            return Err(SessionError::InvalidSession(id.to_string()));
        }
        ensure_receiving(&session)?;

        self.chunks.write_part(id, index, data).await?;
        self.sessions.record_chunk(id, index, total)?;
        debug!(session_id = %id, index, total, "chunk stored");

        if index < total {
            return Ok(ChunkOutcome::Partial(ChunkProgress {
                received: index,
                total,
            }));
        }

        if !self
            .sessions
            .compare_and_set(id, SessionState::Receiving, SessionState::Merging)
        {
            return Err(match self.sessions.get(id) {
                Some(s) if s.state == SessionState::Merging => SessionError::AlreadyMerging(id),
                _ => SessionError::InvalidSession(id.to_string()),
            });
        }

        let guard = ScratchGuard::new(self.sessions.clone(), self.chunks.clone(), id);
        let merged = self.merge(id, total).await;
        guard.release(merged.is_ok()).await;

        let artifact = merged?;
        info!(session_id = %id, size = artifact.size(), "upload session merged");
        Ok(ChunkOutcome::Assembled(AssembledUpload { session, artifact }))
    }

    /// Drop receiving sessions with no chunk activity for `max_idle`,
    /// together with their scratch. Returns how many were swept.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };
        let idle = self.sessions.take_idle(cutoff);
        for session in &idle {
            if let Err(err) = self.chunks.purge(session.id).await {
                warn!(session_id = %session.id, "failed to purge idle session scratch: {}", err);
            }
            info!(
                session_id = %session.id,
                bucket = %session.bucket,
                filename = %session.filename,
                received = session.received.len(),
                "idle upload session expired"
            );
        }
        idle.len()
    }

    /// Concatenate parts 1..=total, strictly in index order.
    async fn merge(&self, id: SessionId, total: u32) -> SessionResult<Artifact> {
        let mut writer = ArtifactWriter::create(&self.scratch_dir).await?;
        for index in 1..=total {
            let mut part = self
                .chunks
                .open_part(id, index)
                .await?
                .ok_or(SessionError::MissingChunk { index, total })?;
            while let Some(chunk) = part.next().await {
                writer.write(&chunk?).await?;
            }
        }
        Ok(writer.finish().await?)
    }
}

/// Purges a session's scratch and retires it. Dropping an unreleased guard
/// (cancelled request, panic) marks the session failed and purges in the
/// background.
struct ScratchGuard {
    sessions: Arc<dyn SessionStore>,
    chunks: Arc<dyn ChunkStore>,
    id: SessionId,
    armed: bool,
}

impl ScratchGuard {
    fn new(sessions: Arc<dyn SessionStore>, chunks: Arc<dyn ChunkStore>, id: SessionId) -> Self {
        Self {
            sessions,
            chunks,
            id,
            armed: true,
        }
    }

    async fn release(mut self, succeeded: bool) {
        self.armed = false;
        if let Err(err) = self.chunks.purge(self.id).await {
            warn!(session_id = %self.id, "failed to purge chunk scratch: {}", err);
        }
        let terminal = if succeeded {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        self.sessions
            .compare_and_set(self.id, SessionState::Merging, terminal);
        self.sessions.remove(self.id);
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.sessions
            .compare_and_set(self.id, SessionState::Merging, SessionState::Failed);
        self.sessions.remove(self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let chunks = self.chunks.clone();
            let id = self.id;
            handle.spawn(async move {
                if let Err(err) = chunks.purge(id).await {
                    warn!(session_id = %id, "failed to purge chunk scratch: {}", err);
                }
            });
        }
    }
}
