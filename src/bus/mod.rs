//! The `bus` module wires the components of a bus instance together.
//!
//! [`Bus::start`] opens storage, creates the `Inbound` and `Outbound`
//! queues, and starts one subscription lease task per configured
//! subscription. Messages addressed to this instance are delivered into the
//! `Inbound` queue, whose listener dispatches them to the application's
//! handlers. Messages sent without a `Destination` are routed by the
//! configured [`SendRules`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticService};
use crate::handler::{HandleMessage, MessageHandler};
use crate::journal::{JournalCategory, MessageJournal, SledMessageJournal};
use crate::message::{Message, SenderPrincipal};
use crate::persistence::SledQueueStore;
use crate::queue::{BoxError, QueueName, QueueingService};
use crate::subscription::{
    LeaseOutcome, SledSubscriptionTracking, SubscriptionLeaseManager, SubscriptionTrackingService,
    TopicName,
};
use crate::transport::{
    HttpTransportService, LocalDeliveryHandler, PublishReport, TransportError, TransportOptions,
};
use crate::utils::BusError;

mod send_rules;

pub use send_rules::{SendRule, SendRules};

const SOURCE: &str = "bus";

pub const INBOUND_QUEUE: &str = "Inbound";

pub struct Bus {
    transport: Arc<HttpTransportService>,
    queueing: Arc<QueueingService>,
    subscription_tracking: Arc<SledSubscriptionTracking>,
    journal: Arc<SledMessageJournal>,
    send_rules: SendRules,
    leases: CancellationToken,
    lease_tasks: Mutex<Vec<JoinHandle<LeaseOutcome>>>,
}

/// Journals messages delivered to this instance and hands them to the
/// `Inbound` queue.
struct InboundDelivery {
    queueing: Arc<QueueingService>,
    inbound: QueueName,
    journal: Arc<SledMessageJournal>,
}

#[async_trait]
impl LocalDeliveryHandler for InboundDelivery {
    async fn deliver(&self, message: Message, principal: Option<SenderPrincipal>) -> Result<(), BoxError> {
        self.journal.append(&message, JournalCategory::Received).await?;
        self.queueing
            .enqueue_message(&self.inbound, message, principal)
            .await?;
        Ok(())
    }
}

impl Bus {
    /// Starts a bus instance from `settings`, dispatching inbound messages
    /// to `handlers`.
    pub async fn start(
        settings: &Settings,
        handlers: Vec<Arc<dyn HandleMessage>>,
        diagnostics: Arc<dyn DiagnosticService>,
    ) -> Result<Self, BusError> {
        let base_uri = settings.base_uri()?;
        let endpoints = settings.endpoint_collection()?;
        let queue_options = settings.queue_options();
        let send_rules = settings.send_rules()?;

        let db = sled::open(&settings.storage.path)?;
        let store = Arc::new(SledQueueStore::from_db(db.clone()));
        let journal = Arc::new(SledMessageJournal::from_db(db.clone())?);
        let subscription_tracking = Arc::new(SledSubscriptionTracking::from_db(db));
        let queueing = Arc::new(QueueingService::new(store, diagnostics.clone()));

        let inbound = QueueName::new(INBOUND_QUEUE);
        let handler = Arc::new(MessageHandler::new(handlers, diagnostics.clone()));
        queueing
            .create_queue(inbound.clone(), handler, queue_options.clone())
            .await?;

        let mut options = TransportOptions::new(base_uri, queueing.clone(), subscription_tracking.clone());
        options.endpoints = endpoints.clone();
        options.journal = Some(journal.clone());
        options.bypass_local_destination = settings.server.bypass_local_destination;
        options.local_delivery = Some(Arc::new(InboundDelivery {
            queueing: queueing.clone(),
            inbound,
            journal: journal.clone(),
        }));
        options.outbound_queue = queue_options;
        options.diagnostics = diagnostics.clone();

        let transport = Arc::new(HttpTransportService::new(options)?);
        transport.init().await?;

        let leases = CancellationToken::new();
        let manager = Arc::new(SubscriptionLeaseManager::new(
            transport.clone(),
            endpoints,
            settings.lease_options(),
            diagnostics.clone(),
        ));
        let lease_tasks = settings
            .subscriptions
            .iter()
            .map(|subscription| {
                let manager = manager.clone();
                let cancel = leases.child_token();
                let endpoint = subscription.endpoint.clone();
                let topic = TopicName::new(subscription.topic.clone());
                let ttl = Duration::from_secs(subscription.ttl_secs);
                tokio::spawn(async move { manager.run_for_endpoint(&endpoint, topic, ttl, cancel).await })
            })
            .collect();

        diagnostics.emit(
            DiagnosticEvent::new(SOURCE, DiagnosticEventKind::ComponentInitialization)
                .uri(Some(transport.base_uri()))
                .detail(format!(
                    "Bus started with {} subscription(s)",
                    settings.subscriptions.len()
                )),
        );
        info!(base_uri = %transport.base_uri(), "Bus started");

        Ok(Self {
            transport,
            queueing,
            subscription_tracking,
            journal,
            send_rules,
            leases,
            lease_tasks: Mutex::new(lease_tasks),
        })
    }

    /// Sends a point-to-point message.
    ///
    /// A message with a `Destination` goes there. Otherwise every endpoint
    /// named by a send rule matching its `MessageName` gets an addressed
    /// copy with a fresh `MessageId`. All endpoints are resolved before
    /// anything is sent, so an unknown endpoint name sends nothing.
    pub async fn send(&self, message: Message, principal: Option<SenderPrincipal>) -> Result<(), BusError> {
        if message.headers().destination().is_some() {
            self.transport.send_message(message, None, principal).await?;
            return Ok(());
        }

        let name = message.headers().message_name().unwrap_or_default();
        let endpoints = self.transport.endpoints();
        let destinations = self
            .send_rules
            .endpoints_for(name)
            .into_iter()
            .map(|endpoint| endpoints.by_name(endpoint).map(|e| e.address.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        if destinations.is_empty() {
            return Err(TransportError::MissingDestination.into());
        }

        debug!(message_name = name, "Routing message to {} endpoint(s)", destinations.len());
        for destination in destinations {
            self.transport
                .send_message(message.readdressed(&destination), None, principal.clone())
                .await?;
        }
        Ok(())
    }

    pub async fn publish(&self, message: &Message, topic: &TopicName) -> Result<PublishReport, BusError> {
        Ok(self.transport.publish_message(message, topic).await?)
    }

    /// Subscribers of the topics this instance publishes.
    pub fn subscription_tracking(&self) -> Arc<dyn SubscriptionTrackingService> {
        self.subscription_tracking.clone()
    }

    /// Every message sent, received or published by this instance.
    pub fn journal(&self) -> &SledMessageJournal {
        &self.journal
    }

    pub fn transport(&self) -> &HttpTransportService {
        &self.transport
    }

    pub fn queueing(&self) -> &QueueingService {
        &self.queueing
    }

    /// Stops every lease task and queue. Pending messages stay in storage.
    pub async fn shutdown(&self) {
        self.leases.cancel();
        let tasks: Vec<_> = self
            .lease_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Subscription lease task failed: {e}");
            }
        }
        self.queueing.shutdown();
        info!("Bus shut down");
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("transport", &self.transport)
            .finish()
    }
}
