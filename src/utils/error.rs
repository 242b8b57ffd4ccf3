//! Error types for the bus.
//!
//! Queue-internal failures are recovered locally and only logged. The
//! variants here are the ones that surface to calling code: request
//! timeouts, malformed `respond` calls, use after shutdown, and the storage
//! errors the durability layer reports to the engine.

use thiserror::Error;

/// Error returned by a subscriber. Logged by the scheduler, never retried.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request to {destination}.{topic} timed out after {timeout_ms}ms")]
    RequestTimeout {
        destination: String,
        topic: String,
        timeout_ms: u64,
    },

    #[error("payload carries no correlation metadata (missing `{field}`)")]
    MissingCorrelation { field: &'static str },

    #[error("communicator for service `{service}` has been shut down")]
    ShutDown { service: String },

    #[error("pending request {correlation_id} was dropped before a response arrived")]
    ResponseDropped { correlation_id: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled operation failed: {0}")]
    Sled(#[from] sled::Error),

    #[error("stored record could not be encoded or decoded: {0}")]
    Codec(#[source] serde_json::Error),
}
