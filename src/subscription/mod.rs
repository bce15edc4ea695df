//! The `subscription` module covers both sides of topic subscriptions.
//!
//! - `tracking`: who subscribes to the topics this instance publishes.
//! - `lease`: the long-running tasks that keep this instance subscribed to
//!   topics published by remote endpoints.

pub mod lease;
pub mod tracking;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use lease::{LeaseOptions, LeaseOutcome, SubscriptionLease, SubscriptionLeaseManager, SubscriptionRequester};
pub use tracking::{
    InMemorySubscriptionTracking, SledSubscriptionTracking, SubscriptionTrackingService, TrackingError,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TopicName {
    fn from(name: String) -> Self {
        Self(name)
    }
}
