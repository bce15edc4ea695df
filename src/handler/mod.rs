//! The `handler` module delivers messages received by this instance to
//! application code.
//!
//! Applications implement [`HandleMessage`]. A [`MessageHandler`] wraps the
//! registered handlers as the listener of the inbound queue, so handler
//! failures are retried by the queue like any other failed attempt.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticService};
use crate::message::Message;
use crate::queue::{BoxError, QueueListener, QueuedMessageContext};

const SOURCE: &str = "handler";

#[async_trait]
pub trait HandleMessage: Send + Sync {
    /// Whether this handler wants `message`. Defaults to every message.
    fn accepts(&self, _message: &Message) -> bool {
        true
    }

    /// Handles one delivery. Call `context.acknowledge()` to mark the
    /// message handled unless the queue acknowledges automatically.
    async fn handle_message(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Accepts messages whose `MessageName` equals the given name.
pub struct NamedHandler<H> {
    name: String,
    inner: H,
}

impl<H: HandleMessage> NamedHandler<H> {
    pub fn new(name: impl Into<String>, inner: H) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl<H: HandleMessage> HandleMessage for NamedHandler<H> {
    fn accepts(&self, message: &Message) -> bool {
        message.headers().message_name() == Some(self.name.as_str()) && self.inner.accepts(message)
    }

    async fn handle_message(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        self.inner.handle_message(message, context, cancel).await
    }
}

pub struct MessageHandler {
    handlers: Vec<Arc<dyn HandleMessage>>,
    diagnostics: Arc<dyn DiagnosticService>,
}

impl MessageHandler {
    pub fn new(handlers: Vec<Arc<dyn HandleMessage>>, diagnostics: Arc<dyn DiagnosticService>) -> Self {
        Self {
            handlers,
            diagnostics,
        }
    }
}

#[async_trait]
impl QueueListener for MessageHandler {
    async fn message_received(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        if message.is_expired() {
            debug!(message_id = %message.id(), "Discarding expired message");
            self.diagnostics.emit(
                DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageExpired)
                    .message(message)
                    .detail("Message expired before it could be handled"),
            );
            context.acknowledge();
            return Ok(());
        }

        let matching: Vec<_> = self.handlers.iter().filter(|h| h.accepts(message)).collect();
        if matching.is_empty() {
            warn!(message_id = %message.id(), name = message.headers().message_name(), "No handler accepts message");
            return Ok(());
        }

        let results = join_all(
            matching
                .iter()
                .map(|h| h.handle_message(message, context, cancel.clone())),
        )
        .await;

        // Every handler has run; the first failure fails the attempt.
        results.into_iter().collect::<Result<Vec<()>, BoxError>>()?;
        Ok(())
    }
}
