//! Artifact output.
//!
//! Every database is written to `<name>.partial` through a buffered writer and only
//! renamed to its final name once the whole artifact has been flushed and synced.
//! A reader therefore never sees a complete-looking file for a failed backup.

use crate::error::{BackupError, Result};
use crate::models::OutputOptions;

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

const PARTIAL_SUFFIX: &str = "partial";
const WRITE_PROBE: &str = ".pgbackup_write_probe";

/// File name of the artifact for a database captured at the given instant.
///
/// Every byte outside letters, digits, `-` and `.` is written as `_XX` hex, `_` included,
/// so distinct database names never share a file name.
pub fn artifact_file_name(database: &str, captured_at: DateTime<Utc>) -> String {
    let mut safe = String::with_capacity(database.len());
    for c in database.chars() {
        if c.is_alphanumeric() || matches!(c, '-' | '.') {
            safe.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(safe, "_{byte:02X}");
            }
        }
    }
    format!("{}_backup_{}.sql", safe, captured_at.format("%Y%m%d_%H%M%S"))
}

/// Ensure the output directory exists and accepts new files.
///
/// Failure here is fatal to the whole run, so it is checked before any database starts.
pub async fn prepare_output_dir(options: &OutputOptions) -> Result<PathBuf> {
    let path = options.directory.clone();

    match tokio::fs::metadata(&path).await {
        Ok(meta) if !meta.is_dir() => {
            return Err(BackupError::sink(&path, "Output path exists but is not a directory"));
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !options.create_dir {
                return Err(BackupError::sink(&path, "Output directory does not exist"));
            }
            tokio::fs::create_dir_all(&path).await.map_err(|e| BackupError::sink_io(&path, e))?;
            tracing::info!(path = %path.display(), "Created output directory");
        }
        Err(e) => return Err(BackupError::sink_io(&path, e)),
    }

    let probe = path.join(WRITE_PROBE);
    tokio::fs::write(&probe, b"").await.map_err(|e| BackupError::sink_io(&path, e))?;
    let _ = tokio::fs::remove_file(&probe).await;

    Ok(path)
}

/// Buffered text writer over any async sink.
pub struct ArtifactWriter<W> {
    inner: BufWriter<W>,
    path: PathBuf,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> ArtifactWriter<W> {
    /// Wrap a sink; `path` is only used for error reporting.
    pub fn new(inner: W, path: impl Into<PathBuf>) -> Self {
        Self { inner: BufWriter::new(inner), path: path.into(), bytes_written: 0 }
    }

    /// Append text.
    pub async fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes()).await
    }

    /// Append raw bytes.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await.map_err(|e| BackupError::sink_io(&self.path, e))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush buffered data to the sink.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(|e| BackupError::sink_io(&self.path, e))
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path used in error messages.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unwrap the sink. Buffered data that was not flushed is lost.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

/// An artifact file being written for one database.
///
/// Dropping it without [`FileArtifact::finish`] removes the partial file unless
/// `keep_partial` was requested.
pub struct FileArtifact {
    writer: Option<ArtifactWriter<File>>,
    partial_path: PathBuf,
    final_path: PathBuf,
    keep_partial: bool,
    settled: bool,
}

impl FileArtifact {
    /// Create `<dir>/<artifact name>.partial`.
    ///
    /// Neither the partial nor the final file may already exist.
    pub async fn create(
        dir: &Path,
        database: &str,
        captured_at: DateTime<Utc>,
        keep_partial: bool,
    ) -> Result<Self> {
        let final_path = dir.join(artifact_file_name(database, captured_at));
        let partial_path = partial_path_for(&final_path);
        ensure_absent(&final_path).await?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial_path)
            .await
            .map_err(|e| BackupError::sink_io(&partial_path, e))?;

        tracing::debug!(database, path = %partial_path.display(), "Opened artifact");

        Ok(Self {
            writer: Some(ArtifactWriter::new(file, &partial_path)),
            partial_path,
            final_path,
            keep_partial,
            settled: false,
        })
    }

    /// Writer for the artifact body.
    pub fn writer(&mut self) -> Result<&mut ArtifactWriter<File>> {
        let path = &self.partial_path;
        self.writer.as_mut().ok_or_else(|| BackupError::sink(path, "Artifact already closed"))
    }

    /// Path the artifact will have once finished.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Path written while the artifact is incomplete.
    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    /// Flush, sync and rename into place. Returns the final path.
    pub async fn finish(mut self) -> Result<PathBuf> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| BackupError::sink(&self.partial_path, "Artifact already closed"))?;
        writer.flush().await?;

        let file = writer.into_inner();
        file.sync_all().await.map_err(|e| BackupError::sink_io(&self.partial_path, e))?;
        drop(file);

        ensure_absent(&self.final_path).await?;
        tokio::fs::rename(&self.partial_path, &self.final_path)
            .await
            .map_err(|e| BackupError::sink_io(&self.final_path, e))?;
        self.settled = true;

        Ok(self.final_path.clone())
    }

    /// Give up on the artifact, removing the partial file unless it should be kept.
    pub async fn abort(mut self) {
        self.settled = true;
        if let Some(mut writer) = self.writer.take() {
            if self.keep_partial {
                let _ = writer.flush().await;
            }
        }

        if self.keep_partial {
            tracing::info!(path = %self.partial_path.display(), "Kept partial artifact");
            return;
        }

        if let Err(e) = tokio::fs::remove_file(&self.partial_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.partial_path.display(),
                    error = %e,
                    "Failed to remove partial artifact"
                );
            }
        }
    }
}

impl Drop for FileArtifact {
    fn drop(&mut self) {
        if self.settled || self.keep_partial {
            return;
        }
        self.writer.take();
        let _ = std::fs::remove_file(&self.partial_path);
    }
}

async fn ensure_absent(path: &Path) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(false) => Ok(()),
        Ok(true) => Err(BackupError::sink(path, "Artifact already exists")),
        Err(e) => Err(BackupError::sink_io(path, e)),
    }
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
