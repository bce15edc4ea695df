use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use super::{MessageQueue, QueueError, QueueListener, QueueName, QueueOptions};
use crate::diagnostics::DiagnosticService;
use crate::message::{Message, MessageId, SenderPrincipal};
use crate::persistence::MessageQueueStore;

/// Registry of named queues that share one store and diagnostic sink.
pub struct QueueingService {
    store: Arc<dyn MessageQueueStore>,
    diagnostics: Arc<dyn DiagnosticService>,
    queues: RwLock<HashMap<QueueName, Arc<MessageQueue>>>,
}

impl QueueingService {
    pub fn new(store: Arc<dyn MessageQueueStore>, diagnostics: Arc<dyn DiagnosticService>) -> Self {
        Self {
            store,
            diagnostics,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and initializes a queue.
    pub async fn create_queue(
        &self,
        name: QueueName,
        listener: Arc<dyn QueueListener>,
        options: QueueOptions,
    ) -> Result<Arc<MessageQueue>, QueueError> {
        let queue = {
            let mut queues = self
                .queues
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queues.contains_key(&name) {
                return Err(QueueError::QueueAlreadyExists(name));
            }
            let queue = Arc::new(MessageQueue::new(
                name.clone(),
                self.store.clone(),
                listener,
                options,
                self.diagnostics.clone(),
            ));
            queues.insert(name.clone(), queue.clone());
            queue
        };

        if let Err(e) = queue.init().await {
            self.remove(&name);
            return Err(e);
        }
        info!(queue = %name, "Queue created");
        Ok(queue)
    }

    pub fn queue(&self, name: &QueueName) -> Option<Arc<MessageQueue>> {
        self.queues
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub async fn enqueue_message(
        &self,
        name: &QueueName,
        message: Message,
        principal: Option<SenderPrincipal>,
    ) -> Result<MessageId, QueueError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.clone()))?;
        queue.enqueue(message, principal).await
    }

    /// Shuts every queue down. Queued messages stay in the store.
    pub fn shutdown(&self) {
        let queues = self
            .queues
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for queue in queues.values() {
            queue.shutdown();
        }
    }

    fn remove(&self, name: &QueueName) {
        self.queues
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }
}
