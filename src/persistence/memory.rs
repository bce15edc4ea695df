use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{MessageQueueStore, QueuedMessage, QueuedMessageState, StoreError};
use crate::message::MessageId;
use crate::queue::QueueName;

/// Keeps queued messages in process memory. Nothing survives a restart of
/// the process, but the store itself can be shared between several queue
/// instances to simulate one.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<QueueName, Vec<QueuedMessage>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single message, whatever its state.
    pub fn get(&self, queue: &QueueName, id: MessageId) -> Option<QueuedMessage> {
        let queues = self.queues.lock().ok()?;
        queues.get(queue)?.iter().find(|m| m.id() == id).cloned()
    }

    fn with_queue<T>(
        &self,
        queue: &QueueName,
        f: impl FnOnce(&mut Vec<QueuedMessage>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        f(queues.entry(queue.clone()).or_default())
    }
}

#[async_trait]
impl MessageQueueStore for InMemoryQueueStore {
    async fn insert(&self, queued: &QueuedMessage) -> Result<MessageId, StoreError> {
        self.with_queue(&queued.queue, |messages| {
            let id = queued.id();
            if messages.iter().any(|m| m.id() == id) {
                return Err(StoreError::Duplicate(id));
            }
            messages.push(queued.clone());
            Ok(id)
        })
    }

    async fn select_pending(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        self.with_queue(queue, |messages| {
            Ok(messages
                .iter()
                .filter(|m| m.state == QueuedMessageState::Pending)
                .cloned()
                .collect())
        })
    }

    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        self.with_queue(queue, |messages| {
            Ok(messages
                .iter()
                .filter(|m| matches!(m.state, QueuedMessageState::Abandoned(_)))
                .cloned()
                .collect())
        })
    }

    async fn record_attempt(
        &self,
        queue: &QueueName,
        id: MessageId,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.with_queue(queue, |messages| {
            let queued = messages
                .iter_mut()
                .find(|m| m.id() == id)
                .ok_or(StoreError::NotFound(id))?;
            queued.attempts = attempts;
            Ok(())
        })
    }

    async fn update_state(
        &self,
        queue: &QueueName,
        id: MessageId,
        state: QueuedMessageState,
    ) -> Result<bool, StoreError> {
        self.with_queue(queue, |messages| {
            let queued = messages
                .iter_mut()
                .find(|m| m.id() == id)
                .ok_or(StoreError::NotFound(id))?;
            if queued.state.is_terminal() {
                return Ok(false);
            }
            queued.state = state;
            Ok(true)
        })
    }
}
