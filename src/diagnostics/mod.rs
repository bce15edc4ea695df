//! The `diagnostics` module is the sink the bus writes named events to.
//!
//! Components receive an `Arc<dyn DiagnosticService>` when they are built
//! and emit events fire-and-forget. [`NoopDiagnostics`] is the default,
//! [`TracingDiagnostics`] forwards events to `tracing`, and
//! [`DiagnosticLog`] keeps them in memory for inspection.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use url::Url;

use crate::message::{Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticEventKind {
    ComponentInitialization,
    MessageEnqueued,
    MessageAcknowledged,
    MessageNotAcknowledged,
    MessageAbandoned,
    MessageExpired,
    MessageDelivered,
    MessageDeliveryFailed,
    QueueListenerError,
    QueueStoreError,
    TransportBypassed,
    CommunicationError,
    AccessDenied,
    SubscriptionRequestSent,
    SubscriptionRenewed,
    SubscriptionFailed,
    EndpointNotFound,
}

impl DiagnosticEventKind {
    /// Whether the event describes a failure an operator should notice.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::MessageAbandoned
                | Self::MessageDeliveryFailed
                | Self::QueueListenerError
                | Self::QueueStoreError
                | Self::CommunicationError
                | Self::AccessDenied
                | Self::MessageNotAcknowledged
                | Self::SubscriptionFailed
                | Self::EndpointNotFound
        )
    }
}

impl fmt::Display for DiagnosticEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single named event with whatever context the emitter had at hand.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticEventKind,
    pub source: &'static str,
    pub detail: Option<String>,
    pub message_id: Option<MessageId>,
    pub queue: Option<String>,
    pub topic: Option<String>,
    pub uri: Option<Url>,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl DiagnosticEvent {
    pub fn new(source: &'static str, kind: DiagnosticEventKind) -> Self {
        Self {
            kind,
            source,
            detail: None,
            message_id: None,
            queue: None,
            topic: None,
            uri: None,
            status: None,
            error: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn message(mut self, message: &Message) -> Self {
        self.message_id = Some(message.id());
        self
    }

    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn queue(mut self, queue: impl fmt::Display) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    pub fn topic(mut self, topic: impl fmt::Display) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn uri(mut self, uri: Option<&Url>) -> Self {
        self.uri = uri.cloned();
        self
    }

    pub fn status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    pub fn error(mut self, error: &dyn std::error::Error) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

pub trait DiagnosticService: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticService for NoopDiagnostics {
    fn emit(&self, _event: DiagnosticEvent) {}
}

/// Shared no-op sink used when a component is built without one.
pub fn noop() -> Arc<dyn DiagnosticService> {
    Arc::new(NoopDiagnostics)
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticService for TracingDiagnostics {
    fn emit(&self, event: DiagnosticEvent) {
        let message_id = event.message_id.map(|id| id.to_string());
        let uri = event.uri.as_ref().map(Url::as_str);
        if event.kind.is_error() {
            warn!(
                kind = %event.kind,
                source = event.source,
                message_id = message_id.as_deref(),
                queue = event.queue.as_deref(),
                topic = event.topic.as_deref(),
                uri,
                status = event.status,
                error = event.error.as_deref(),
                "{}",
                event.detail.as_deref().unwrap_or_default()
            );
        } else if event.kind == DiagnosticEventKind::ComponentInitialization {
            info!(source = event.source, "{}", event.detail.as_deref().unwrap_or_default());
        } else {
            debug!(
                kind = %event.kind,
                source = event.source,
                message_id = message_id.as_deref(),
                queue = event.queue.as_deref(),
                topic = event.topic.as_deref(),
                uri,
                status = event.status,
                "{}",
                event.detail.as_deref().unwrap_or_default()
            );
        }
    }
}

/// Records events in memory in emission order.
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: DiagnosticEventKind) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.kind == kind).count())
            .unwrap_or(0)
    }
}

impl DiagnosticService for DiagnosticLog {
    fn emit(&self, event: DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageHeaders;

    #[test]
    fn test_log_records_events_in_order() {
        let log = DiagnosticLog::new();
        let msg = Message::new(MessageHeaders::new(), "");
        log.emit(DiagnosticEvent::new("test", DiagnosticEventKind::MessageEnqueued).message(&msg));
        log.emit(DiagnosticEvent::new("test", DiagnosticEventKind::MessageAbandoned).status(Some(500)));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message_id, Some(msg.id()));
        assert_eq!(events[1].status, Some(500));
        assert_eq!(log.count(DiagnosticEventKind::MessageAbandoned), 1);
    }

    #[test]
    fn test_error_kinds() {
        assert!(DiagnosticEventKind::SubscriptionFailed.is_error());
        assert!(!DiagnosticEventKind::MessageDelivered.is_error());
    }
}
