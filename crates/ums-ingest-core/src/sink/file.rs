//! Append-only file sink.

use crate::buffer::Batch;
use crate::config::{SinkConfig, SinkFormat};
use crate::sink::DeliverySink;
use crate::transform::DeliveryRecord;
use crate::DeliveryError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Serialize)]
struct JsonLine<'a> {
    headers: &'a BTreeMap<String, String>,
    body: std::borrow::Cow<'a, str>,
}

/// Writes one line per record and syncs once per batch.
///
/// A failed write truncates the file back to its length before the batch,
/// so a rejected batch leaves no partial output behind.
pub struct FileSink {
    path: PathBuf,
    format: SinkFormat,
    file: Mutex<Option<File>>,
}

impl FileSink {
    /// Create a sink appending to `path`. The file is opened lazily.
    pub fn new(path: impl Into<PathBuf>, format: SinkFormat) -> Self {
        Self {
            path: path.into(),
            format,
            file: Mutex::new(None),
        }
    }

    /// Create a sink from configuration.
    pub fn from_config(config: &SinkConfig) -> Self {
        Self::new(config.path.clone(), config.format)
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, DeliveryError> {
        let mut out = Vec::with_capacity(batch.iter().map(|r| r.body.len() + 1).sum());
        for record in batch {
            match self.format {
                SinkFormat::Body => out.extend_from_slice(&record.body),
                SinkFormat::Json => {
                    serde_json::to_writer(&mut out, &json_line(record))
                        .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
                }
            }
            out.push(b'\n');
        }
        Ok(out)
    }

    async fn open(&self) -> Result<File, DeliveryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?)
    }
}

fn json_line(record: &DeliveryRecord) -> JsonLine<'_> {
    JsonLine {
        headers: &record.headers,
        body: String::from_utf8_lossy(&record.body),
    }
}

#[async_trait]
impl DeliverySink for FileSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let bytes = self.encode(batch)?;

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(DeliveryError::Rejected("sink file unavailable".into()));
        };

        let before = file.metadata().await?.len();
        let written: std::io::Result<()> = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "Batch write failed, rolling back");
            if let Err(rollback) = file.set_len(before).await {
                warn!(error = %rollback, "Rollback truncate failed");
            }
            // Reopen on next delivery
            *guard = None;
            return Err(DeliveryError::Io(e));
        }

        debug!(
            path = %self.path.display(),
            records = batch.len(),
            bytes = bytes.len(),
            "Batch written"
        );
        Ok(())
    }
}
