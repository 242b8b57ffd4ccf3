//! The `utils` module provides the error types and logging setup shared
//! across the `servicebus` crate.

pub mod error;
pub mod logging;

pub use error::{BusError, HandlerError, HandlerResult, StorageError};
