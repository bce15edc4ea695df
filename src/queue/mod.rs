//! The `queue` module turns the persisted backlog of a named queue into a
//! live stream of deliveries.
//!
//! - `engine`: [`MessageQueue`], one per queue name: durable enqueue,
//!   dispatcher, bounded workers, retry and abandonment.
//! - `context`: [`QueuedMessageContext`], handed to the listener for each
//!   delivery attempt.
//! - `service`: [`QueueingService`], a registry of queues sharing a store.

pub mod context;
pub mod engine;
pub mod service;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::persistence::StoreError;

pub use context::QueuedMessageContext;
pub use engine::MessageQueue;
pub use service::QueueingService;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Tuning knobs for a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum number of listener invocations running at once.
    pub concurrency_limit: usize,
    /// Attempts after which an unacknowledged message is abandoned.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Acknowledge every invocation that succeeds without an explicit
    /// acknowledgement or rejection.
    pub auto_acknowledge: bool,
}

impl QueueOptions {
    /// Replaces zero limits with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.concurrency_limit == 0 {
            self.concurrency_limit = DEFAULT_CONCURRENCY_LIMIT;
        }
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            auto_acknowledge: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("queue {0} is shut down; message stays pending in storage")]
    BufferClosed(QueueName),
    #[error("queue {0} already exists")]
    QueueAlreadyExists(QueueName),
    #[error("queue {0} not found")]
    QueueNotFound(QueueName),
}

/// Receives the messages delivered by a queue.
///
/// Returning `Err` (or panicking) counts as an unacknowledged attempt; the
/// queue retries until `max_attempts` is reached.
#[async_trait]
pub trait QueueListener: Send + Sync {
    async fn message_received(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests;
