use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::models::SessionData;

/// Suffixes tried after the plain name is taken.
const MAX_NAME_SUFFIX: u32 = 100;

/// Receives every ended session exactly once.
pub trait SessionExporter: Send + Sync {
    fn export_session(&self, data: SessionData) -> BoxFuture<'_, Result<()>>;
}

/// Writes each session as pretty JSON to `<dir>/session-<start>.json`.
/// Existing files are never overwritten; a clashing name gets `-1`, `-2`, ...
pub struct JsonFileExporter {
    dir: PathBuf,
}

impl JsonFileExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Preferred file name, before any clash suffix.
    pub fn file_name(data: &SessionData) -> String {
        format!("session-{}.json", Self::stem(data))
    }

    fn stem(data: &SessionData) -> String {
        data.start_time.format("%Y%m%dT%H%M%S%.3fZ").to_string()
    }

    async fn create_unique(&self, data: &SessionData) -> Result<(PathBuf, File)> {
        for suffix in 0..=MAX_NAME_SUFFIX {
            let name = match suffix {
                0 => Self::file_name(data),
                n => format!("session-{}-{}.json", Self::stem(data), n),
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        }
        bail!(
            "No free file name for session {} in {}",
            Self::stem(data),
            self.dir.display()
        )
    }

    async fn write(&self, data: SessionData) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let body = serde_json::to_vec_pretty(&data).context("Failed to serialize session")?;
        let (path, mut file) = self.create_unique(&data).await?;
        file.write_all(&body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to flush {}", path.display()))?;

        info!(path = %path.display(), events = data.events.len(), "Session exported");
        Ok(())
    }
}

impl SessionExporter for JsonFileExporter {
    fn export_session(&self, data: SessionData) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write(data))
    }
}
