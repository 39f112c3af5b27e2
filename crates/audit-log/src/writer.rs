use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::entry::AuditEntry;

#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to prepare journal directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open journal {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode journal entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffered JSON-lines appender. One [`AuditEntry`] per line.
pub struct AuditWriter {
    path: PathBuf,
    out: BufWriter<tokio::fs::File>,
    lines: u64,
}

impl AuditWriter {
    /// Open `path` for appending, creating it and its parent directories.
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
            .map_err(|source| AuditWriteError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
            lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries appended through this writer.
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    pub async fn append(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.lines += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.out.flush().await?;
        Ok(())
    }
}
