//! Subscription leases
//!
//! A lease keeps this instance subscribed to one topic of one remote
//! endpoint. Each lease runs as its own task:
//!
//! - a successful request for a lease without TTL completes the task
//! - a successful request for an expiring lease is repeated after half the
//!   TTL
//! - a retryable failure is repeated after the retry interval
//! - a fatal failure abandons the lease
//!
//! Cancellation interrupts any wait or in-flight request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TopicName;
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventKind, DiagnosticService};
use crate::transport::endpoint::{Endpoint, EndpointCollection};
use crate::transport::error::TransportError;

const SOURCE: &str = "subscription";

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLease {
    pub endpoint: Endpoint,
    pub topic: TopicName,
    /// Zero requests a subscription that never expires.
    pub ttl: Duration,
}

impl SubscriptionLease {
    pub fn new(endpoint: Endpoint, topic: TopicName, ttl: Duration) -> Self {
        Self { endpoint, topic, ttl }
    }

    pub fn expires(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Half the TTL, so the subscription is refreshed before the publisher
    /// drops it, however short the TTL.
    pub fn renewal_interval(&self) -> Duration {
        self.ttl / 2
    }
}

/// Sends one subscription request for a lease.
#[async_trait]
pub trait SubscriptionRequester: Send + Sync {
    async fn send_subscription_request(&self, lease: &SubscriptionLease) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    pub retry_interval: Duration,
    /// Treat 401 responses as fatal instead of retrying them.
    pub abandon_on_unauthorized: bool,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            abandon_on_unauthorized: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The publisher accepted a subscription that never expires.
    Completed,
    /// A fatal error ended the lease.
    Abandoned,
    Cancelled,
}

pub struct SubscriptionLeaseManager {
    requester: Arc<dyn SubscriptionRequester>,
    endpoints: EndpointCollection,
    options: LeaseOptions,
    diagnostics: Arc<dyn DiagnosticService>,
}

impl SubscriptionLeaseManager {
    pub fn new(
        requester: Arc<dyn SubscriptionRequester>,
        endpoints: EndpointCollection,
        options: LeaseOptions,
        diagnostics: Arc<dyn DiagnosticService>,
    ) -> Self {
        Self {
            requester,
            endpoints,
            options,
            diagnostics,
        }
    }

    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }

    /// Resolves `endpoint_name` and runs a lease against it. An unknown
    /// endpoint abandons the lease immediately.
    pub async fn run_for_endpoint(
        &self,
        endpoint_name: &str,
        topic: TopicName,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> LeaseOutcome {
        let endpoint = match self.endpoints.by_name(endpoint_name) {
            Ok(endpoint) => endpoint.clone(),
            Err(e) => {
                warn!(endpoint = endpoint_name, topic = %topic, "Cannot subscribe: {e}");
                self.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::EndpointNotFound)
                        .topic(&topic)
                        .detail(format!("Fatal error sending subscription request: endpoint {endpoint_name} not found"))
                        .error(&e),
                );
                self.diagnostics.emit(
                    DiagnosticEvent::new(SOURCE, DiagnosticEventKind::SubscriptionFailed)
                        .topic(&topic)
                        .detail("Fatal error sending subscription request. Subscription abandoned"),
                );
                return LeaseOutcome::Abandoned;
            }
        };
        self.run(SubscriptionLease::new(endpoint, topic, ttl), cancel).await
    }

    /// Drives one lease until it completes, is abandoned or `cancel` fires.
    pub async fn run(&self, lease: SubscriptionLease, cancel: CancellationToken) -> LeaseOutcome {
        let topic = &lease.topic;
        let address = &lease.endpoint.address;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LeaseOutcome::Cancelled,
                result = self.requester.send_subscription_request(&lease) => result,
            };

            let wait = match result {
                Ok(()) if !lease.expires() => {
                    info!(topic = %topic, publisher = %address, "Subscribed without expiration");
                    return LeaseOutcome::Completed;
                }
                Ok(()) => {
                    let renew_after = lease.renewal_interval();
                    debug!(topic = %topic, publisher = %address, "Subscription renewed. Next renewal in {renew_after:?}");
                    self.diagnostics.emit(
                        DiagnosticEvent::new(SOURCE, DiagnosticEventKind::SubscriptionRenewed)
                            .topic(topic)
                            .uri(Some(address))
                            .detail(format!("Subscription renewed. Next renewal in {renew_after:?}")),
                    );
                    renew_after
                }
                Err(e) if self.is_fatal(&e) => {
                    warn!(topic = %topic, publisher = %address, "Fatal error sending subscription request: {e}");
                    self.diagnostics.emit(
                        DiagnosticEvent::new(SOURCE, DiagnosticEventKind::SubscriptionFailed)
                            .topic(topic)
                            .uri(Some(address))
                            .detail("Fatal error sending subscription request. Subscription abandoned")
                            .error(&e),
                    );
                    return LeaseOutcome::Abandoned;
                }
                Err(e) => {
                    let retry_after = self.options.retry_interval;
                    warn!(topic = %topic, publisher = %address, "Error sending subscription request: {e}. Retrying in {retry_after:?}");
                    self.diagnostics.emit(
                        DiagnosticEvent::new(SOURCE, DiagnosticEventKind::SubscriptionFailed)
                            .topic(topic)
                            .uri(Some(address))
                            .detail(format!("Non-fatal error sending subscription request. Retrying in {retry_after:?}"))
                            .error(&e),
                    );
                    retry_after
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LeaseOutcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn is_fatal(&self, error: &TransportError) -> bool {
        match error {
            TransportError::Unauthorized => self.options.abandon_on_unauthorized,
            other => !other.is_retryable(),
        }
    }
}
