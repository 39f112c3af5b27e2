use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_BUFFER: usize = 1024;

/// Idle time after which buffered lines are flushed to disk.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable handle for submitting entries to the journal writer task.
///
/// A sink created with [`AuditSink::disabled`] accepts entries and discards
/// them, so callers never have to branch on whether journaling is on.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Open the journal at `path` and spawn the background writer.
    ///
    /// The writer exits after a final flush once every clone of the sink has
    /// been dropped. Write errors are reported through `tracing` and the
    /// offending entry is skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let writer = AuditWriter::open(path).await?;
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);
        let handle = tokio::spawn(drain(writer, rx));
        Ok((Self { tx: Some(tx) }, handle))
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an entry, waiting for channel capacity if the writer is behind.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                "audit writer gone, entry dropped"
            );
        }
    }
}

async fn drain(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let mut dirty = false;

    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(entry)) => match writer.append(&entry).await {
                Ok(()) => dirty = true,
                Err(err) => tracing::error!(%err, "failed to append audit entry"),
            },
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "final audit flush failed");
                    }
                }
                tracing::debug!(
                    path = %writer.path().display(),
                    lines = writer.lines_written(),
                    "audit writer stopped"
                );
                return;
            }
            Err(_) if dirty => match writer.flush().await {
                Ok(()) => dirty = false,
                Err(err) => tracing::error!(%err, "periodic audit flush failed"),
            },
            Err(_) => {}
        }
    }
}
