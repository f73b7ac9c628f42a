use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::record::AuditRecord;

/// Errors that can occur during alert log I/O.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create parent directories for {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open alert log {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to alert log: {0}")]
    Write(std::io::Error),

    #[error("failed to flush alert log: {0}")]
    Flush(std::io::Error),
}

/// Append-only JSON-lines writer for [`AuditRecord`]s.
///
/// A batch of records is encoded into one buffer and handed to the file in a
/// single `write_all`, so a record is never split across two writes.
pub struct AuditWriter {
    path: PathBuf,
    file: tokio::fs::File,
    buf: Vec<u8>,
    lines_written: u64,
}

impl AuditWriter {
    /// Open (or create) the log at `path` in append mode, creating parent
    /// directories as needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditWriteError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| AuditWriteError::OpenFile {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file,
            buf: Vec::with_capacity(4096),
            lines_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total records appended through this writer.
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Append one record as a single JSON line.
    pub async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditWriteError> {
        self.write_batch(std::slice::from_ref(record)).await
    }

    /// Append several records. Either all lines reach the file or the batch
    /// fails as a whole at the `write_all` boundary.
    ///
    /// The file is flushed before returning, so an I/O error is reported
    /// against the batch that caused it.
    pub async fn write_batch(&mut self, records: &[AuditRecord]) -> Result<(), AuditWriteError> {
        if records.is_empty() {
            return Ok(());
        }

        self.buf.clear();
        for record in records {
            serde_json::to_writer(&mut self.buf, record)?;
            self.buf.push(b'\n');
        }

        self.file
            .write_all(&self.buf)
            .await
            .map_err(AuditWriteError::Write)?;
        self.flush().await?;
        self.lines_written += records.len() as u64;

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(AuditWriteError::Flush)
    }
}
