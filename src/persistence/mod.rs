//! The `persistence` module keeps critical-tier messages on disk so that they
//! survive a process restart.
//!
//! Each bus owns a storage area partitioned by service name. A message is
//! written when it is accepted, rewritten when its attempt count changes, and
//! removed on its terminal outcome. `load_all` is called once at startup to
//! rebuild the queue.

pub mod file_store;
pub mod sled_store;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::config::{PersistenceBackend, PersistenceSettings};
use crate::utils::StorageError;

pub use file_store::FileStore;
pub use sled_store::SledStore;

#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Write (or overwrite) the full record for `message`.
    async fn persist(&self, message: &Message) -> Result<(), StorageError>;

    /// Remove the record for `id`. Removing a missing record is not an error.
    async fn remove(&self, id: &str) -> Result<(), StorageError>;

    /// Every record currently stored.
    async fn load_all(&self) -> Result<Vec<Message>, StorageError>;
}

/// Store that keeps nothing. Used for ephemeral services and most tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl MessageStore for NoopStore {
    async fn persist(&self, _message: &Message) -> Result<(), StorageError> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        Ok(Vec::new())
    }
}

/// Directory holding `service`'s durable records.
pub fn service_dir(settings: &PersistenceSettings, service: &str) -> PathBuf {
    PathBuf::from(&settings.dir).join(service)
}

/// Open the configured backend for `service`.
pub fn open_store(
    settings: &PersistenceSettings,
    service: &str,
) -> Result<Arc<dyn MessageStore>, StorageError> {
    let dir = service_dir(settings, service);
    let store: Arc<dyn MessageStore> = match settings.backend {
        PersistenceBackend::File => Arc::new(FileStore::new(dir)),
        PersistenceBackend::Sled => Arc::new(SledStore::open(dir.join("sled"))?),
        PersistenceBackend::Memory => Arc::new(NoopStore),
    };
    Ok(store)
}
