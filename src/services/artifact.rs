//! Scratch-resident artifacts: an uploaded file fully assembled on disk.
//!
//! The backing file lives in the scratch directory and is removed when the
//! `Artifact` is dropped, whichever way the request ends.

use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};

#[derive(Debug)]
pub struct Artifact {
    path: TempPath,
    size: u64,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Incremental builder for an [`Artifact`]. Dropping it unfinished removes
/// the partial file.
pub struct ArtifactWriter {
    path: TempPath,
    file: File,
    size: u64,
}

impl ArtifactWriter {
    pub async fn create(scratch_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(scratch_dir).await?;
        let scratch_dir: PathBuf = scratch_dir.to_path_buf();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("artifact-")
                .tempfile_in(scratch_dir)
        })
        .await
        .map_err(io::Error::other)??;
        let (file, path) = named.into_parts();
        Ok(Self {
            path,
            file: File::from_std(file),
            size: 0,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<Artifact> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(Artifact {
            path: self.path,
            size: self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finished_artifact_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArtifactWriter::create(dir.path()).await.unwrap();
        writer.write(b"pay").await.unwrap();
        writer.write(b"load").await.unwrap();
        let artifact = writer.finish().await.unwrap();
        let path = artifact.path().to_path_buf();
        assert_eq!(artifact.size(), 7);
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unfinished_writer_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArtifactWriter::create(dir.path()).await.unwrap();
        writer.write(b"partial").await.unwrap();
        drop(writer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
