//! Queue store backed by `sled`
//!
//! Each queue gets its own tree named `queue/{name}`. Records are keyed by
//! message id and carry a sequence number drawn from `Db::generate_id`, so
//! a pending scan can restore insertion order. State transitions use
//! `compare_and_swap` against the record that was read, retrying when
//! another writer got in between.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use async_trait::async_trait;

use super::{MessageQueueStore, QueuedMessage, QueuedMessageState, StoreError};
use crate::message::{Message, MessageId, SenderPrincipal};
use crate::queue::QueueName;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredQueuedMessage {
    sequence: u64,
    message: Message,
    principal: Option<String>,
    attempts: u32,
    acknowledged: Option<DateTime<Utc>>,
    abandoned: Option<DateTime<Utc>>,
}

impl StoredQueuedMessage {
    fn from_queued(sequence: u64, queued: &QueuedMessage) -> Result<Self, StoreError> {
        let principal = queued
            .principal
            .as_ref()
            .map(SenderPrincipal::to_json)
            .transpose()?;
        let mut stored = Self {
            sequence,
            message: queued.message.clone(),
            principal,
            attempts: queued.attempts,
            acknowledged: None,
            abandoned: None,
        };
        stored.apply_state(queued.state);
        Ok(stored)
    }

    fn state(&self) -> QueuedMessageState {
        match (self.acknowledged, self.abandoned) {
            (Some(at), _) => QueuedMessageState::Acknowledged(at),
            (None, Some(at)) => QueuedMessageState::Abandoned(at),
            (None, None) => QueuedMessageState::Pending,
        }
    }

    fn apply_state(&mut self, state: QueuedMessageState) {
        match state {
            QueuedMessageState::Pending => {
                self.acknowledged = None;
                self.abandoned = None;
            }
            QueuedMessageState::Acknowledged(at) => self.acknowledged = Some(at),
            QueuedMessageState::Abandoned(at) => self.abandoned = Some(at),
        }
    }

    fn into_queued(self, queue: &QueueName) -> Result<QueuedMessage, StoreError> {
        let state = self.state();
        let principal = self
            .principal
            .as_deref()
            .map(SenderPrincipal::from_json)
            .transpose()?;
        Ok(QueuedMessage {
            queue: queue.clone(),
            message: self.message,
            principal,
            attempts: self.attempts,
            state,
        })
    }
}

#[derive(Clone)]
pub struct SledQueueStore {
    db: Db,
}

impl SledQueueStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::from_db(sled::open(path)?))
    }

    /// Share an already opened database, for example with the subscription
    /// tracker.
    pub fn from_db(db: Db) -> Self {
        Self { db }
    }

    fn tree(&self, queue: &QueueName) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("queue/{queue}"))?)
    }

    fn select(
        &self,
        queue: &QueueName,
        keep: fn(&QueuedMessageState) -> bool,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let tree = self.tree(queue)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let stored: StoredQueuedMessage = serde_json::from_slice(&value)?;
            if keep(&stored.state()) {
                records.push(stored);
            }
        }
        records.sort_by_key(|r| r.sequence);
        records.into_iter().map(|r| r.into_queued(queue)).collect()
    }

    /// Read-modify-write of one record under compare-and-swap. `change`
    /// returns `None` to leave the record untouched.
    fn modify<T>(
        &self,
        queue: &QueueName,
        id: MessageId,
        change: impl Fn(&mut StoredQueuedMessage) -> Option<T>,
        unchanged: T,
    ) -> Result<T, StoreError> {
        let tree = self.tree(queue)?;
        let key = id.as_uuid().as_bytes().to_vec();
        loop {
            let current = tree.get(&key)?.ok_or(StoreError::NotFound(id))?;
            let mut stored: StoredQueuedMessage = serde_json::from_slice(&current)?;
            let Some(result) = change(&mut stored) else {
                return Ok(unchanged);
            };
            let updated = serde_json::to_vec(&stored)?;
            if tree
                .compare_and_swap(&key, Some(&current), Some(updated))?
                .is_ok()
            {
                tree.flush()?;
                return Ok(result);
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[async_trait]
impl MessageQueueStore for SledQueueStore {
    async fn insert(&self, queued: &QueuedMessage) -> Result<MessageId, StoreError> {
        let store = self.clone();
        let queued = queued.clone();
        blocking(move || {
            let id = queued.id();
            let tree = store.tree(&queued.queue)?;
            let stored = StoredQueuedMessage::from_queued(store.db.generate_id()?, &queued)?;
            let bytes = serde_json::to_vec(&stored)?;
            let inserted =
                tree.compare_and_swap(id.as_uuid().as_bytes(), None as Option<&[u8]>, Some(bytes))?;
            if inserted.is_err() {
                return Err(StoreError::Duplicate(id));
            }
            tree.flush()?;
            Ok(id)
        })
        .await
    }

    async fn select_pending(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        let store = self.clone();
        let queue = queue.clone();
        blocking(move || {
            store.select(&queue, |state| *state == QueuedMessageState::Pending)
        })
        .await
    }

    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        let store = self.clone();
        let queue = queue.clone();
        blocking(move || {
            store.select(&queue, |state| matches!(state, QueuedMessageState::Abandoned(_)))
        })
        .await
    }

    async fn record_attempt(
        &self,
        queue: &QueueName,
        id: MessageId,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let queue = queue.clone();
        blocking(move || {
            store.modify(
                &queue,
                id,
                |stored| {
                    stored.attempts = attempts;
                    Some(())
                },
                (),
            )
        })
        .await
    }

    async fn update_state(
        &self,
        queue: &QueueName,
        id: MessageId,
        state: QueuedMessageState,
    ) -> Result<bool, StoreError> {
        let store = self.clone();
        let queue = queue.clone();
        blocking(move || {
            store.modify(
                &queue,
                id,
                |stored| {
                    if stored.state().is_terminal() {
                        return None;
                    }
                    stored.apply_state(state);
                    Some(true)
                },
                false,
            )
        })
        .await
    }
}

impl std::fmt::Debug for SledQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledQueueStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
