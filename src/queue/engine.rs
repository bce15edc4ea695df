//! Queue engine
//!
//! A [`MessageQueue`] owns one named queue:
//! - `enqueue` writes the message to the store, then hands it to an
//!   in-memory buffer
//! - a single dispatcher task drains the buffer and spawns one worker per
//!   message without waiting on it
//! - each worker runs the delivery loop for its message: attempt, then
//!   acknowledge, abandon, or wait and retry
//!
//! Concurrency and usage notes:
//! - Listener invocations are capped by a semaphore of
//!   `concurrency_limit` permits. A permit is held only while the listener
//!   runs, never during a retry wait.
//! - Attempts for one message are strictly sequential. Messages of the
//!   same queue have no ordering guarantee between each other.
//! - Shutting down cancels the dispatcher, pending permit waits and retry
//!   waits. Listener invocations already running are left to finish.
//!   Anything not terminal stays pending in the store for the next `init`.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{QueueError, QueueListener, QueueName, QueueOptions, QueuedMessageContext};
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticService};
use crate::message::{Message, MessageId, SenderPrincipal};
use crate::persistence::{MessageQueueStore, QueuedMessage, QueuedMessageState, StoreError};

const SOURCE: &str = "queue";

pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: QueueName,
    store: Arc<dyn MessageQueueStore>,
    listener: Arc<dyn QueueListener>,
    options: QueueOptions,
    diagnostics: Arc<dyn DiagnosticService>,
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueuedMessage>>>,
    // Ids currently buffered or being worked on; guards against handing the
    // same message off twice when `init` races with `enqueue`.
    buffered: Mutex<HashSet<MessageId>>,
    initialized: AtomicBool,
    slots: Semaphore,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageQueue {
    pub fn new(
        name: QueueName,
        store: Arc<dyn MessageQueueStore>,
        listener: Arc<dyn QueueListener>,
        options: QueueOptions,
        diagnostics: Arc<dyn DiagnosticService>,
    ) -> Self {
        let options = options.normalized();
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                name,
                store,
                listener,
                slots: Semaphore::new(options.concurrency_limit),
                options,
                diagnostics,
                sender,
                receiver: Mutex::new(Some(receiver)),
                buffered: Mutex::new(HashSet::new()),
                initialized: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.inner.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Loads the pending backlog and starts the dispatcher.
    ///
    /// Only the first call has any effect; later or concurrent calls return
    /// immediately. If the backlog cannot be read the queue stays
    /// uninitialized and the error is returned.
    pub async fn init(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let backlog = match inner.store.select_pending(&inner.name).await {
            Ok(backlog) => backlog,
            Err(e) => {
                inner.initialized.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let count = backlog.len();
        for queued in backlog {
            debug!(queue = %inner.name, message_id = %queued.id(), "Enqueueing existing message");
            inner.hand_off(queued)?;
        }

        let Some(receiver) = lock(&inner.receiver).take() else {
            warn!(queue = %inner.name, "Queue was shut down before it was initialized");
            return Ok(());
        };
        tokio::spawn(dispatch(inner.clone(), receiver));

        inner.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::ComponentInitialization)
                .queue(&inner.name)
                .detail(format!("Queue {} initialized with {count} pending message(s)", inner.name)),
        );
        Ok(())
    }

    /// Durably stores `message` and schedules it for delivery.
    ///
    /// The store write completes before this returns. If the queue has been
    /// shut down the message is still stored and `BufferClosed` is returned.
    pub async fn enqueue(
        &self,
        message: Message,
        principal: Option<SenderPrincipal>,
    ) -> Result<MessageId, QueueError> {
        let inner = &self.inner;
        let queued = QueuedMessage::new(inner.name.clone(), message, principal);
        let id = inner.store.insert(&queued).await?;

        inner.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageEnqueued)
                .queue(&inner.name)
                .message_id(id),
        );

        inner.hand_off(queued)?;
        Ok(id)
    }

    /// Messages that exhausted their attempts.
    pub async fn abandoned(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.inner.store.select_abandoned(&self.inner.name).await
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.receiver).take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl QueueInner {
    fn hand_off(&self, queued: QueuedMessage) -> Result<(), QueueError> {
        let id = queued.id();
        if !lock(&self.buffered).insert(id) {
            return Ok(());
        }
        if self.cancel.is_cancelled() || self.sender.send(queued).is_err() {
            lock(&self.buffered).remove(&id);
            return Err(QueueError::BufferClosed(self.name.clone()));
        }
        Ok(())
    }

    fn report_store_error(&self, id: MessageId, action: &str, error: &StoreError) {
        warn!(queue = %self.name, message_id = %id, "Failed to {action}: {error}");
        self.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::QueueStoreError)
                .queue(&self.name)
                .message_id(id)
                .detail(format!("Failed to {action}"))
                .error(error),
        );
    }

    /// Runs one listener invocation. Returns `None` if the queue was shut
    /// down while waiting for a processing slot, otherwise whether the
    /// attempt was acknowledged.
    async fn attempt(&self, queued: &QueuedMessage) -> Option<bool> {
        let id = queued.id();
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            permit = self.slots.acquire() => permit.ok()?,
        };

        let context = QueuedMessageContext::new(
            queued.message.headers().clone(),
            queued.principal.clone(),
            queued.attempts,
        );
        let invocation =
            self.listener
                .message_received(&queued.message, &context, self.cancel.child_token());
        let outcome = AssertUnwindSafe(invocation).catch_unwind().await;
        drop(permit);

        match outcome {
            Ok(Ok(())) => {
                // An invocation cut short by shutdown is never auto-acknowledged.
                if self.options.auto_acknowledge && !context.is_rejected() && !self.cancel.is_cancelled() {
                    context.acknowledge();
                }
            }
            Ok(Err(e)) => {
                warn!(queue = %self.name, message_id = %id, "Unhandled error handling queued message: {e}");
                self.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::QueueListenerError)
                        .queue(&self.name)
                        .message_id(id)
                        .error(&*e),
                );
            }
            Err(_) => {
                warn!(queue = %self.name, message_id = %id, "Listener panicked handling queued message");
                self.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::QueueListenerError)
                        .queue(&self.name)
                        .message_id(id)
                        .detail("listener panicked"),
                );
            }
        }
        Some(context.is_acknowledged())
    }

    /// Records `Abandoned` without invoking the listener again. A failed
    /// write is retried after `retry_delay` until it succeeds or the queue
    /// shuts down.
    async fn abandon(&self, id: MessageId, attempts: u32) {
        loop {
            if let Some(recorded) = self.finish(id, QueuedMessageState::Abandoned(Utc::now())).await {
                if recorded {
                    self.diagnostics.emit(
                        DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageAbandoned)
                            .queue(&self.name)
                            .message_id(id)
                            .detail(format!("abandoned after {attempts} attempt(s)")),
                    );
                }
                return;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }
    }

    /// Writes a terminal state. `Some(true)` means recorded, `Some(false)`
    /// means another writer finished the message first, `None` means the
    /// write failed and the message is still pending.
    async fn finish(&self, id: MessageId, state: QueuedMessageState) -> Option<bool> {
        match self.store.update_state(&self.name, id, state).await {
            Ok(recorded) => Some(recorded),
            Err(e) => {
                self.report_store_error(id, "record terminal state", &e);
                None
            }
        }
    }
}

async fn dispatch(inner: Arc<QueueInner>, mut receiver: mpsc::UnboundedReceiver<QueuedMessage>) {
    loop {
        let queued = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(queued) => queued,
                None => break,
            },
        };
        tokio::spawn(process(inner.clone(), queued));
    }
    debug!(queue = %inner.name, "Dispatcher stopped");
}

async fn process(inner: Arc<QueueInner>, mut queued: QueuedMessage) {
    let id = queued.id();
    let max_attempts = inner.options.max_attempts;

    loop {
        queued.attempts += 1;
        let attempt = queued.attempts;
        debug!(queue = %inner.name, message_id = %id, "Processing queued message (attempt {attempt} of {max_attempts})");

        if let Err(e) = inner.store.record_attempt(&inner.name, id, attempt).await {
            inner.report_store_error(id, "record delivery attempt", &e);
        }

        let Some(acknowledged) = inner.attempt(&queued).await else {
            break;
        };

        if acknowledged {
            // A failed write leaves the message pending and counts as a failed attempt.
            if let Some(recorded) = inner.finish(id, QueuedMessageState::Acknowledged(Utc::now())).await {
                if recorded {
                    debug!(queue = %inner.name, message_id = %id, "Message acknowledged");
                    inner.diagnostics.emit(
                        DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageAcknowledged)
                            .queue(&inner.name)
                            .message_id(id),
                    );
                }
                break;
            }
        } else if inner.cancel.is_cancelled() {
            debug!(queue = %inner.name, message_id = %id, "Queue shut down during attempt; message stays pending");
            break;
        } else {
            inner.diagnostics.emit(
                DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageNotAcknowledged)
                    .queue(&inner.name)
                    .message_id(id)
                    .detail(format!("attempt {attempt} of {max_attempts}")),
            );
        }

        if attempt >= max_attempts {
            warn!(queue = %inner.name, message_id = %id, "Maximum attempts to process message exceeded");
            inner.abandon(id, attempt).await;
            break;
        }

        debug!(queue = %inner.name, message_id = %id, "Message not acknowledged. Retrying in {:?}", inner.options.retry_delay);
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.options.retry_delay) => {}
        }
    }

    lock(&inner.buffered).remove(&id);
}
