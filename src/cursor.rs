use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::platform::MessageId;

/// Durable home of the last-processed message id.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<MessageId>>;

    async fn save(&self, id: MessageId) -> Result<()>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Cursor kept as decimal text in a single file.
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursor".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn parse_cursor(content: &str, path: &Path) -> Result<MessageId> {
    let value: MessageId = content
        .trim()
        .parse()
        .with_context(|| format!("Corrupt cursor file {}: {:?}", path.display(), content))?;
    if value < 0 {
        anyhow::bail!("Corrupt cursor file {}: negative id {}", path.display(), value);
    }
    Ok(value)
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<MessageId>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_cursor(&content, &self.path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read cursor file: {}", self.path.display())),
        }
    }

    /// Write to a sibling temp file, fsync, then rename over the real file so a
    /// crash leaves either the old or the new value.
    async fn save(&self, id: MessageId) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        file.write_all(id.to_string().as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", temp.display()))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| {
                format!(
                    "Failed to move {} into place at {}",
                    temp.display(),
                    self.path.display()
                )
            })?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory watermark backed by a [`CursorStore`].
///
/// The value only ever moves forward. A failed save is logged and the
/// in-memory value still advances, so delivery continues within this process
/// while the durable value goes stale.
pub struct Cursor {
    value: MessageId,
    store: Box<dyn CursorStore>,
}

impl Cursor {
    /// Load the persisted watermark, falling back to 0 when it is missing or
    /// unreadable.
    pub async fn open(store: Box<dyn CursorStore>) -> Self {
        let value = match store.load().await {
            Ok(Some(value)) => {
                info!("Resuming after message {} ({})", value, store.describe());
                value
            }
            Ok(None) => {
                info!("No cursor at {}, starting from the beginning", store.describe());
                0
            }
            Err(e) => {
                warn!(
                    stage = "cursor",
                    "Failed to read cursor, starting from 0 (already-relayed messages may be sent again): {:#}",
                    e
                );
                0
            }
        };
        Self { value, store }
    }

    pub fn value(&self) -> MessageId {
        self.value
    }

    /// Move the watermark to `id` and persist it. Returns false if the new
    /// value could not be made durable.
    pub async fn advance(&mut self, id: MessageId) -> bool {
        if id <= self.value {
            debug!("Cursor already at {}, ignoring {}", self.value, id);
            return true;
        }
        self.value = id;
        match self.store.save(id).await {
            Ok(()) => {
                debug!("Cursor saved: {}", id);
                true
            }
            Err(e) => {
                warn!(
                    message_id = id,
                    stage = "cursor",
                    "Failed to persist cursor, progress is not durable: {:#}",
                    e
                );
                false
            }
        }
    }
}
