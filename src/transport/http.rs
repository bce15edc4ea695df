//! HTTP transport
//!
//! [`HttpTransportService`] moves messages between bus instances:
//!
//! - synchronous sends are posted immediately and the outcome is returned
//!   to the caller
//! - asynchronous sends are stored on the `Outbound` queue and posted by
//!   its listener, so the queue's retry policy applies
//! - publications are fanned out to every live subscriber of the topic
//!
//! Every send is journaled before it goes on the wire. Messages addressed
//! to this instance can skip the wire entirely when bypass is enabled.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::endpoint::{EndpointCollection, EndpointCredentials, with_trailing_slash};
use super::error::{TransportError, classify_status};
use crate::diagnostics::{self, DiagnosticEvent, DiagnosticEventKind, DiagnosticService};
use crate::journal::{JournalCategory, MessageJournal};
use crate::message::{Message, MessageId, SenderPrincipal, headers};
use crate::queue::{BoxError, QueueListener, QueueName, QueueOptions, QueuedMessageContext, QueueingService};
use crate::subscription::{SubscriptionLease, SubscriptionRequester, SubscriptionTrackingService, TopicName};

const SOURCE: &str = "transport";

pub const OUTBOUND_QUEUE: &str = "Outbound";

/// Receives messages whose destination is this instance when the wire is
/// bypassed.
#[async_trait]
pub trait LocalDeliveryHandler: Send + Sync {
    async fn deliver(&self, message: Message, principal: Option<SenderPrincipal>) -> Result<(), BoxError>;
}

pub struct TransportOptions {
    /// Base URI under which this instance is reachable.
    pub base_uri: Url,
    pub endpoints: EndpointCollection,
    pub queueing: Arc<QueueingService>,
    pub subscription_tracking: Arc<dyn SubscriptionTrackingService>,
    pub journal: Option<Arc<dyn MessageJournal>>,
    pub bypass_local_destination: bool,
    pub local_delivery: Option<Arc<dyn LocalDeliveryHandler>>,
    pub outbound_queue: QueueOptions,
    pub diagnostics: Arc<dyn DiagnosticService>,
}

impl TransportOptions {
    pub fn new(
        base_uri: Url,
        queueing: Arc<QueueingService>,
        subscription_tracking: Arc<dyn SubscriptionTrackingService>,
    ) -> Self {
        Self {
            base_uri,
            endpoints: EndpointCollection::default(),
            queueing,
            subscription_tracking,
            journal: None,
            bypass_local_destination: false,
            local_delivery: None,
            outbound_queue: QueueOptions::default(),
            diagnostics: diagnostics::noop(),
        }
    }
}

/// Result of fanning a publication out to a topic's subscribers.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub subscribers: usize,
    pub failures: Vec<(Url, TransportError)>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct HttpTransportService {
    sender: Arc<WireSender>,
    queueing: Arc<QueueingService>,
    subscription_tracking: Arc<dyn SubscriptionTrackingService>,
    outbound: QueueName,
    outbound_options: QueueOptions,
}

/// The part of the transport the `Outbound` queue listener needs. Kept
/// apart from the service so the queue does not own the service that owns
/// the queue.
struct WireSender {
    base_uri: Url,
    client: reqwest::Client,
    endpoints: EndpointCollection,
    journal: Option<Arc<dyn MessageJournal>>,
    bypass_local_destination: bool,
    local_delivery: Option<Arc<dyn LocalDeliveryHandler>>,
    diagnostics: Arc<dyn DiagnosticService>,
}

impl HttpTransportService {
    pub fn new(options: TransportOptions) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        Ok(Self {
            sender: Arc::new(WireSender {
                base_uri: with_trailing_slash(options.base_uri),
                client,
                endpoints: options.endpoints,
                journal: options.journal,
                bypass_local_destination: options.bypass_local_destination,
                local_delivery: options.local_delivery,
                diagnostics: options.diagnostics,
            }),
            queueing: options.queueing,
            subscription_tracking: options.subscription_tracking,
            outbound: QueueName::new(OUTBOUND_QUEUE),
            outbound_options: options.outbound_queue,
        })
    }

    pub fn base_uri(&self) -> &Url {
        &self.sender.base_uri
    }

    pub fn endpoints(&self) -> &EndpointCollection {
        &self.sender.endpoints
    }

    /// Creates the `Outbound` queue. Messages left pending by a previous
    /// run are picked up again.
    pub async fn init(&self) -> Result<(), TransportError> {
        let listener = Arc::new(OutboundListener {
            sender: self.sender.clone(),
        });
        self.queueing
            .create_queue(self.outbound.clone(), listener, self.outbound_options.clone())
            .await?;
        self.sender.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::ComponentInitialization)
                .detail("HTTP transport service initialized"),
        );
        info!(base_uri = %self.sender.base_uri, "HTTP transport initialized");
        Ok(())
    }

    /// Sends `message` to its `Destination`.
    ///
    /// Synchronous messages are posted before this returns, using
    /// `credentials` or else the credentials of the endpoint at the
    /// destination address. Other messages are stored on the `Outbound`
    /// queue; the call returns once they are durable.
    pub async fn send_message(
        &self,
        message: Message,
        credentials: Option<EndpointCredentials>,
        principal: Option<SenderPrincipal>,
    ) -> Result<(), TransportError> {
        let destination = message
            .headers()
            .destination()
            .ok_or(TransportError::MissingDestination)?;

        if message.headers().synchronous() {
            let credentials =
                credentials.or_else(|| self.sender.endpoints.credentials_for(&destination));
            return self
                .sender
                .transport_message(&message, credentials.as_ref(), principal)
                .await;
        }

        self.queueing
            .enqueue_message(&self.outbound, message, principal)
            .await?;
        Ok(())
    }

    /// Sends a copy of `message` to every current subscriber of `topic`.
    ///
    /// Each copy gets its own `MessageId`. A failure for one subscriber is
    /// recorded in the report and does not affect the others.
    pub async fn publish_message(
        &self,
        message: &Message,
        topic: &TopicName,
    ) -> Result<PublishReport, TransportError> {
        let sender = &self.sender;
        if let Some(journal) = &sender.journal {
            journal.append(message, JournalCategory::Published).await?;
        }

        let subscribers = self.subscription_tracking.get_subscribers(topic).await?;
        let mut report = PublishReport {
            subscribers: subscribers.len(),
            failures: Vec::new(),
        };
        debug!(topic = %topic, "Publishing message {} to {} subscriber(s)", message.id(), subscribers.len());

        let mut synchronous = Vec::new();
        for subscriber in subscribers {
            let addressed = message.readdressed(&subscriber);
            if addressed.headers().synchronous() {
                let credentials = sender.endpoints.credentials_for(&subscriber);
                synchronous.push(async move {
                    let result = sender
                        .transport_message(&addressed, credentials.as_ref(), None)
                        .await;
                    (subscriber, result)
                });
                continue;
            }

            if let Err(e) = self
                .queueing
                .enqueue_message(&self.outbound, addressed, None)
                .await
            {
                warn!(topic = %topic, subscriber = %subscriber, "Failed to enqueue publication: {e}");
                sender.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::MessageDeliveryFailed)
                        .message(message)
                        .topic(topic)
                        .uri(Some(&subscriber))
                        .error(&e),
                );
                report.failures.push((subscriber, e.into()));
            }
        }

        for (subscriber, result) in join_all(synchronous).await {
            if let Err(e) = result {
                warn!(topic = %topic, subscriber = %subscriber, "Failed to deliver publication: {e}");
                report.failures.push((subscriber, e));
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl SubscriptionRequester for HttpTransportService {
    async fn send_subscription_request(&self, lease: &SubscriptionLease) -> Result<(), TransportError> {
        self.sender.send_subscription_request(lease).await
    }
}

impl std::fmt::Debug for HttpTransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportService")
            .field("base_uri", &self.sender.base_uri.as_str())
            .field("endpoints", &self.sender.endpoints.len())
            .field("bypass_local_destination", &self.sender.bypass_local_destination)
            .finish()
    }
}

fn message_uri(base: &Url, id: MessageId) -> Result<Url, TransportError> {
    let id = id.to_string();
    base.join(&format!("message/{}", urlencoding::encode(&id)))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

fn subscriber_uri(lease: &SubscriptionLease, local: &Url) -> Result<Url, TransportError> {
    let base = with_trailing_slash(lease.endpoint.address.clone());
    let mut uri = base
        .join(&format!("topic/{}/subscriber", urlencoding::encode(lease.topic.as_str())))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    {
        let mut query = uri.query_pairs_mut();
        query.append_pair("uri", local.as_str());
        if lease.expires() {
            query.append_pair("ttl", &lease.ttl.as_secs().to_string());
        }
    }
    Ok(uri)
}

impl WireSender {
    /// Journals and delivers one message, reporting the outcome through
    /// diagnostics.
    async fn transport_message(
        &self,
        message: &Message,
        credentials: Option<&EndpointCredentials>,
        principal: Option<SenderPrincipal>,
    ) -> Result<(), TransportError> {
        let destination = message
            .headers()
            .destination()
            .ok_or(TransportError::MissingDestination)?;
        let base = with_trailing_slash(destination);

        let mut post_uri = None;
        let mut status = None;
        let result = async {
            if let Some(journal) = &self.journal {
                journal.append(message, JournalCategory::Sent).await?;
            }
            if self.bypass_local_destination && base == self.base_uri {
                return self.deliver_locally(message, principal).await;
            }
            let uri = message_uri(&base, message.id())?;
            post_uri = Some(uri.clone());
            let (code, outcome) = self.post_message(&uri, message, credentials).await;
            status = code;
            outcome
        }
        .await;

        let uri = post_uri.as_ref().unwrap_or(&base);
        let kind = match &result {
            Ok(()) => DiagnosticEventKind::MessageDelivered,
            Err(e) => {
                self.report_failure(message, uri, status, e);
                DiagnosticEventKind::MessageDeliveryFailed
            }
        };
        self.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, kind)
                .message(message)
                .uri(Some(uri))
                .status(status),
        );
        result
    }

    async fn deliver_locally(
        &self,
        message: &Message,
        principal: Option<SenderPrincipal>,
    ) -> Result<(), TransportError> {
        debug!(message_id = %message.id(), "Destination is local; bypassing HTTP transport");
        self.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::TransportBypassed)
                .message(message)
                .uri(Some(&self.base_uri)),
        );
        match &self.local_delivery {
            Some(handler) => handler
                .deliver(message.clone(), principal)
                .await
                .map_err(|e| TransportError::LocalDelivery(e.to_string())),
            None => {
                warn!(message_id = %message.id(), "No local delivery handler registered; message dropped");
                Ok(())
            }
        }
    }

    async fn post_message(
        &self,
        uri: &Url,
        message: &Message,
        credentials: Option<&EndpointCredentials>,
    ) -> (Option<u16>, Result<(), TransportError>) {
        let mut request = self.client.post(uri.clone());
        for (name, value) in message.headers().iter() {
            if name.eq_ignore_ascii_case(headers::CONTENT_TYPE) {
                request = request.header(CONTENT_TYPE, value);
            } else {
                request = request.header(name, value);
            }
        }
        if let Some(credentials) = credentials {
            request = credentials.apply(request);
        }

        match request.body(message.content().to_string()).send().await {
            Ok(response) => {
                let status = response.status();
                (Some(status.as_u16()), classify_status(status))
            }
            Err(e) => (None, Err(TransportError::from_reqwest(e, uri))),
        }
    }

    fn report_failure(&self, message: &Message, uri: &Url, status: Option<u16>, error: &TransportError) {
        let kind = match error {
            TransportError::Unauthorized => DiagnosticEventKind::AccessDenied,
            TransportError::MessageNotAcknowledged => DiagnosticEventKind::MessageNotAcknowledged,
            _ => DiagnosticEventKind::CommunicationError,
        };
        warn!(message_id = %message.id(), uri = %uri, status, "Error sending message: {error}");
        self.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, kind)
                .message(message)
                .uri(Some(uri))
                .status(status)
                .detail(format!("Error sending message ID {}", message.id()))
                .error(error),
        );
    }

    async fn send_subscription_request(&self, lease: &SubscriptionLease) -> Result<(), TransportError> {
        let uri = subscriber_uri(lease, &self.base_uri)?;
        let mut request = self.client.post(uri.clone()).body("");
        if let Some(credentials) = &lease.endpoint.credentials {
            request = credentials.apply(request);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError::from_reqwest(e, &uri);
                self.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::CommunicationError)
                        .topic(&lease.topic)
                        .uri(Some(&uri))
                        .detail(format!(
                            "Error sending subscription request for topic {} of publisher {}",
                            lease.topic, lease.endpoint.address
                        ))
                        .error(&error),
                );
                return Err(error);
            }
        };

        let status = response.status();
        self.diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::SubscriptionRequestSent)
                .topic(&lease.topic)
                .uri(Some(&uri))
                .status(Some(status.as_u16())),
        );
        classify_status(status)
    }
}

/// Posts messages taken from the `Outbound` queue. A failed post leaves the
/// message unacknowledged so the queue retries it.
struct OutboundListener {
    sender: Arc<WireSender>,
}

#[async_trait]
impl QueueListener for OutboundListener {
    async fn message_received(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let credentials = message
            .headers()
            .destination()
            .and_then(|destination| self.sender.endpoints.credentials_for(&destination));
        let delivery =
            self.sender
                .transport_message(message, credentials.as_ref(), context.principal().cloned());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                context.reject();
                return Ok(());
            }
            result = delivery => result?,
        }
        context.acknowledge();
        Ok(())
    }
}
