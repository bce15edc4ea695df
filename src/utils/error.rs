//! Crate-level error returned by the bus host.
//!
//! Each layer keeps its own error enum; `BusError` only wraps them so that
//! `Bus` and the binary can use `?` across layers.

use config::ConfigError;

use crate::journal::JournalError;
use crate::queue::QueueError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
