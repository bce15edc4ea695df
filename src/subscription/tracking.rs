//! Subscription tracking
//!
//! Records which remote instances subscribe to which local topics. A
//! subscription carries an optional expiry; a zero TTL means it never
//! expires. Expired entries are filtered out of `get_subscribers` rather
//! than swept eagerly.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;
use url::Url;

use super::TopicName;

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait SubscriptionTrackingService: Send + Sync {
    /// Adds or refreshes a subscription. A zero `ttl` never expires.
    async fn add_subscription(
        &self,
        topic: &TopicName,
        subscriber: &Url,
        ttl: Duration,
    ) -> Result<(), TrackingError>;

    async fn remove_subscription(&self, topic: &TopicName, subscriber: &Url) -> Result<(), TrackingError>;

    /// Subscribers whose subscription has not expired.
    async fn get_subscribers(&self, topic: &TopicName) -> Result<Vec<Url>, TrackingError>;
}

fn expiry_for(ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    chrono::Duration::from_std(ttl).ok().map(|ttl| Utc::now() + ttl)
}

fn is_live(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires.is_none_or(|expires| expires > now)
}

/// A topic and its subscribers, each with an optional expiry.
#[derive(Debug, Default)]
struct Topic {
    subscribers: HashMap<Url, Option<DateTime<Utc>>>,
}

impl Topic {
    fn subscribe(&mut self, subscriber: Url, expires: Option<DateTime<Utc>>) {
        self.subscribers.insert(subscriber, expires);
    }

    fn unsubscribe(&mut self, subscriber: &Url) {
        self.subscribers.remove(subscriber);
    }

    /// Drops expired subscribers and returns the rest.
    fn live_subscribers(&mut self, now: DateTime<Utc>) -> Vec<Url> {
        self.subscribers.retain(|_, expires| is_live(*expires, now));
        let mut live: Vec<Url> = self.subscribers.keys().cloned().collect();
        live.sort();
        live
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionTracking {
    topics: Mutex<HashMap<TopicName, Topic>>,
}

impl InMemorySubscriptionTracking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionTrackingService for InMemorySubscriptionTracking {
    async fn add_subscription(
        &self,
        topic: &TopicName,
        subscriber: &Url,
        ttl: Duration,
    ) -> Result<(), TrackingError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.clone())
            .or_default()
            .subscribe(subscriber.clone(), expiry_for(ttl));
        debug!(topic = %topic, subscriber = %subscriber, "Subscription added");
        Ok(())
    }

    async fn remove_subscription(&self, topic: &TopicName, subscriber: &Url) -> Result<(), TrackingError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = topics.get_mut(topic) {
            entry.unsubscribe(subscriber);
            if entry.subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn get_subscribers(&self, topic: &TopicName) -> Result<Vec<Url>, TrackingError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let live = entry.live_subscribers(Utc::now());
        if live.is_empty() {
            topics.remove(topic);
        }
        Ok(live)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoredSubscription {
    expires: Option<DateTime<Utc>>,
}

/// Subscription tracker persisted in a sled tree per topic, keyed by
/// subscriber URI.
#[derive(Clone)]
pub struct SledSubscriptionTracking {
    db: Db,
}

impl SledSubscriptionTracking {
    pub fn open(path: &str) -> Result<Self, TrackingError> {
        Ok(Self::from_db(sled::open(path)?))
    }

    pub fn from_db(db: Db) -> Self {
        Self { db }
    }

    fn tree(&self, topic: &TopicName) -> Result<Tree, TrackingError> {
        Ok(self.db.open_tree(format!("subscriptions/{topic}"))?)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, TrackingError>
where
    F: FnOnce() -> Result<T, TrackingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TrackingError::Task(e.to_string()))?
}

#[async_trait]
impl SubscriptionTrackingService for SledSubscriptionTracking {
    async fn add_subscription(
        &self,
        topic: &TopicName,
        subscriber: &Url,
        ttl: Duration,
    ) -> Result<(), TrackingError> {
        let tracker = self.clone();
        let topic = topic.clone();
        let subscriber = subscriber.clone();
        blocking(move || {
            let tree = tracker.tree(&topic)?;
            let record = StoredSubscription {
                expires: expiry_for(ttl),
            };
            tree.insert(subscriber.as_str().as_bytes(), serde_json::to_vec(&record)?)?;
            tree.flush()?;
            debug!(topic = %topic, subscriber = %subscriber, "Subscription added");
            Ok(())
        })
        .await
    }

    async fn remove_subscription(&self, topic: &TopicName, subscriber: &Url) -> Result<(), TrackingError> {
        let tracker = self.clone();
        let topic = topic.clone();
        let subscriber = subscriber.clone();
        blocking(move || {
            let tree = tracker.tree(&topic)?;
            tree.remove(subscriber.as_str().as_bytes())?;
            tree.flush()?;
            Ok(())
        })
        .await
    }

    async fn get_subscribers(&self, topic: &TopicName) -> Result<Vec<Url>, TrackingError> {
        let tracker = self.clone();
        let topic = topic.clone();
        blocking(move || {
            let tree = tracker.tree(&topic)?;
            let now = Utc::now();
            let mut subscribers = Vec::new();
            let mut expired = Vec::new();
            for entry in tree.iter() {
                let (key, value) = entry?;
                let record: StoredSubscription = serde_json::from_slice(&value)?;
                if !is_live(record.expires, now) {
                    expired.push((key, value));
                    continue;
                }
                // Keys are written from `Url::as_str`, so anything unparsable
                // was not written by this tracker.
                match std::str::from_utf8(&key).ok().and_then(|s| Url::parse(s).ok()) {
                    Some(subscriber) => subscribers.push(subscriber),
                    None => debug!(topic = %topic, "Skipping unreadable subscriber key"),
                }
            }
            // A renewal that lands between the scan and the removal keeps its entry.
            for (key, value) in &expired {
                let _ = tree.compare_and_swap(key, Some(value), None as Option<&[u8]>)?;
            }
            if !expired.is_empty() {
                debug!(topic = %topic, "Removed {} expired subscription(s)", expired.len());
            }
            Ok(subscribers)
        })
        .await
    }
}

impl std::fmt::Debug for SledSubscriptionTracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledSubscriptionTracking")
            .field("db", &"sled::Db")
            .finish()
    }
}
