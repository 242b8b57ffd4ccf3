//! One JSON file per message, named `<message-id>.json`, under the service's
//! storage directory. The directory is created lazily on first write.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use super::MessageStore;
use crate::broker::message::Message;
use crate::utils::StorageError;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn persist(&self, message: &Message) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_vec_pretty(message).map_err(StorageError::Codec)?;

        // write-then-rename so a crash never leaves a truncated record behind
        let tmp = self.dir.join(format!("{}.tmp", message.id));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, self.path_for(&message.id)).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<Message>(&data) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable message record"),
            }
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}
