//! 7z extraction backends.
//!
//! The ingestion pipeline only needs "unpack this archive into that
//! directory"; how the bytes get there is pluggable.

use async_trait::async_trait;
use clap::ValueEnum;
use sevenz_rust::{Password, SevenZReader};
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("7z decode failed: {0}")]
    Decode(String),
    #[error("failed to launch `{bin}`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: io::Error,
    },
    #[error("`{bin}` exited with {status}: {stderr}")]
    Tool {
        bin: String,
        status: String,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unpack `archive` into the existing directory `dest`.
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError>;
}

/// Which backend handles 7z archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SevenZipMode {
    /// In-process decoder.
    Native,
    /// Shell out to the `7z` command-line tool.
    External,
    /// Native first, external tool when native decoding fails.
    Auto,
}

pub fn extractor_for(mode: SevenZipMode, bin: &str) -> Arc<dyn Extractor> {
    match mode {
        SevenZipMode::Native => Arc::new(NativeSevenZip),
        SevenZipMode::External => Arc::new(ExternalSevenZip::new(bin)),
        SevenZipMode::Auto => Arc::new(FallbackExtractor::new(
            Arc::new(NativeSevenZip),
            Arc::new(ExternalSevenZip::new(bin)),
        )),
    }
}

pub struct NativeSevenZip;

#[async_trait]
impl Extractor for NativeSevenZip {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_native(&archive, &dest))
            .await
            .map_err(|e| ExtractError::Decode(e.to_string()))?
    }
}

fn unpack_native(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let mut reader = SevenZReader::open(archive, Password::empty())
        .map_err(|e| ExtractError::Decode(e.to_string()))?;

    let mut write_error: Option<io::Error> = None;
    reader
        .for_each_entries(|entry, data| {
            let Some(relative) = contained_path(entry.name()) else {
                debug!(entry = entry.name(), "ignoring 7z entry outside the work dir");
                return Ok(true);
            };
            let out_path = dest.join(relative);
            let written = if entry.is_directory() {
                std::fs::create_dir_all(&out_path)
            } else {
                write_entry(&out_path, data)
            };
            match written {
                Ok(()) => Ok(true),
                Err(err) => {
                    write_error = Some(err);
                    Ok(false)
                }
            }
        })
        .map_err(|e| ExtractError::Decode(e.to_string()))?;

    match write_error {
        Some(err) => Err(ExtractError::Io(err)),
        None => Ok(()),
    }
}

fn write_entry(out_path: &Path, data: &mut dyn io::Read) -> io::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(out_path)?;
    io::copy(data, &mut out)?;
    Ok(())
}

/// Relative form of an entry name, or `None` if it would escape the
/// destination directory.
fn contained_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut path = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!path.as_os_str().is_empty()).then_some(path)
}

/// Runs `<bin> x -y -o<dest> <archive>`.
pub struct ExternalSevenZip {
    bin: String,
}

impl ExternalSevenZip {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl Extractor for ExternalSevenZip {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let output = Command::new(&self.bin)
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", dest.display()))
            .arg(archive)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExtractError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(ExtractError::Tool {
            bin: self.bin.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Tries `primary`, then `fallback` on a wiped destination.
pub struct FallbackExtractor {
    primary: Arc<dyn Extractor>,
    fallback: Arc<dyn Extractor>,
}

impl FallbackExtractor {
    pub fn new(primary: Arc<dyn Extractor>, fallback: Arc<dyn Extractor>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Extractor for FallbackExtractor {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        match self.primary.extract(archive, dest).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    "7z extraction failed, retrying: {}",
                    err
                );
                fs::remove_dir_all(dest).await?;
                fs::create_dir_all(dest).await?;
                self.fallback.extract(archive, dest).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Failing;

    #[async_trait]
    impl Extractor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn extract(&self, _archive: &Path, dest: &Path) -> Result<(), ExtractError> {
            std::fs::write(dest.join("half-written"), b"junk")?;
            Err(ExtractError::Decode("corrupt header".into()))
        }
    }

    #[derive(Default)]
    struct Writing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extractor for Writing {
        fn name(&self) -> &'static str {
            "writing"
        }

        async fn extract(&self, _archive: &Path, dest: &Path) -> Result<(), ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dest.join("a.txt"), b"hello")?;
            Ok(())
        }
    }

    #[test]
    fn contained_path_rejects_escapes() {
        assert_eq!(contained_path("docs/a.txt"), Some(PathBuf::from("docs/a.txt")));
        assert_eq!(contained_path("docs\\a.txt"), Some(PathBuf::from("docs/a.txt")));
        assert_eq!(contained_path("./a.txt"), Some(PathBuf::from("a.txt")));
        assert_eq!(contained_path("../etc/passwd"), None);
        assert_eq!(contained_path("/etc/passwd"), None);
        assert_eq!(contained_path(""), None);
    }

    #[tokio::test]
    async fn fallback_runs_on_a_clean_directory() {
        let dir = TempDir::new().unwrap();
        let writing = Arc::new(Writing::default());
        let extractor = FallbackExtractor::new(Arc::new(Failing), writing.clone());

        extractor
            .extract(Path::new("ignored.7z"), dir.path())
            .await
            .unwrap();

        assert_eq!(writing.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("half-written").exists());
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn native_rejects_non_7z_input() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("fake.7z");
        std::fs::write(&archive, b"definitely not an archive").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let err = NativeSevenZip.extract(&archive, &out).await.unwrap_err();
        assert!(matches!(err, ExtractError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_tool_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let err = ExternalSevenZip::new("definitely-not-a-7z-binary")
            .extract(&dir.path().join("a.7z"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Spawn { .. }));
    }
}
