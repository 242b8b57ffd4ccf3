//! Persistence backed by `sled`
//!
//! Records live in a single `critical` tree keyed by message id, with the
//! JSON-encoded message as the value. Useful when a service would rather not
//! keep thousands of small files around.

use std::path::Path;

use async_trait::async_trait;
use sled::{Db, Tree};
use tracing::warn;

use super::MessageStore;
use crate::broker::message::Message;
use crate::utils::StorageError;

const TREE: &str = "critical";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn persist(&self, message: &Message) -> Result<(), StorageError> {
        let data = serde_json::to_vec(message).map_err(StorageError::Codec)?;
        self.tree.insert(message.id.as_bytes(), data)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.tree.remove(id.as_bytes())?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        let mut messages = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<Message>(&value) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "skipping unreadable message record"
                ),
            }
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("records", &self.tree.len())
            .finish()
    }
}
