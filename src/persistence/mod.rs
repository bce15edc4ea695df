//! The `persistence` module provides the durable store behind every queue.
//!
//! Queues never keep state that only lives in memory: a message is written
//! here before it is buffered, every delivery attempt is counted here, and
//! the terminal outcome (acknowledged or abandoned) is recorded here. On
//! start-up a queue reloads its pending backlog from the store.
//!
//! Two backends ship with the crate: [`sled_store::SledQueueStore`] for
//! durable storage in an embedded `sled` database and
//! [`memory::InMemoryQueueStore`] for tests and ephemeral buses.

pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::message::principal::PrincipalError;
use crate::message::{Message, MessageId, SenderPrincipal};
use crate::queue::QueueName;

pub use memory::InMemoryQueueStore;
pub use sled_store::SledQueueStore;

/// Delivery state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedMessageState {
    Pending,
    Acknowledged(DateTime<Utc>),
    Abandoned(DateTime<Utc>),
}

impl QueuedMessageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueuedMessageState::Pending)
    }
}

/// A message plus the queue-local delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub queue: QueueName,
    pub message: Message,
    pub principal: Option<SenderPrincipal>,
    pub attempts: u32,
    pub state: QueuedMessageState,
}

impl QueuedMessage {
    pub fn new(queue: QueueName, message: Message, principal: Option<SenderPrincipal>) -> Self {
        Self {
            queue,
            message,
            principal,
            attempts: 0,
            state: QueuedMessageState::Pending,
        }
    }

    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    pub fn acknowledged_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            QueuedMessageState::Acknowledged(at) => Some(at),
            _ => None,
        }
    }

    pub fn abandoned_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            QueuedMessageState::Abandoned(at) => Some(at),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode or decode queued message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid sender principal: {0}")]
    Principal(#[from] PrincipalError),
    #[error("message {0} is already queued")]
    Duplicate(MessageId),
    #[error("message {0} not found in queue")]
    NotFound(MessageId),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage contract consumed by the queue engine.
///
/// Every method is atomic on its own. `update_state` is a compare-and-swap
/// from `Pending`, so several processes sharing one store never record two
/// terminal outcomes for the same message.
#[async_trait]
pub trait MessageQueueStore: Send + Sync {
    async fn insert(&self, queued: &QueuedMessage) -> Result<MessageId, StoreError>;

    /// Pending messages of `queue` in insertion order.
    async fn select_pending(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Abandoned messages of `queue`, for operator inspection.
    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError>;

    async fn record_attempt(
        &self,
        queue: &QueueName,
        id: MessageId,
        attempts: u32,
    ) -> Result<(), StoreError>;

    /// Moves a pending message to `state`. Returns `false` when the message
    /// had already reached a terminal state.
    async fn update_state(
        &self,
        queue: &QueueName,
        id: MessageId,
        state: QueuedMessageState,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests;
