use std::collections::HashMap;

use serde::Deserialize;

use crate::queue::{DEFAULT_CONCURRENCY_LIMIT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::subscription::lease::DEFAULT_RETRY_INTERVAL;

/// Top-level configuration settings for a bus instance.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub subscription: SubscriptionSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    /// Remote bus instances by name.
    pub endpoints: HashMap<String, EndpointSettings>,
    /// Topics of remote endpoints this instance subscribes to.
    pub subscriptions: Vec<SubscriptionEntry>,
    /// Where messages without a `Destination` are sent.
    pub send_rules: Vec<SendRuleEntry>,
}

/// Where this instance is reachable and whether messages addressed to it
/// skip HTTP.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub base_uri: String,
    pub bypass_local_destination: bool,
}

/// Delivery policy applied to every queue.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub concurrency_limit: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub auto_acknowledge: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionSettings {
    pub retry_interval_secs: u64,
    pub abandon_on_unauthorized: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// A remote endpoint. Either `username` and `password` or `token` may be
/// given for authentication.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EndpointSettings {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionEntry {
    pub endpoint: String,
    pub topic: String,
    /// Zero or absent subscribes without expiration.
    #[serde(default)]
    pub ttl_secs: u64,
}

/// Routes messages whose name matches the `name_pattern` regex to the
/// endpoint named `endpoint`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SendRuleEntry {
    pub name_pattern: String,
    pub endpoint: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub subscription: Option<PartialSubscriptionSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub endpoints: Option<HashMap<String, EndpointSettings>>,
    pub subscriptions: Option<Vec<SubscriptionEntry>>,
    pub send_rules: Option<Vec<SendRuleEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub base_uri: Option<String>,
    pub bypass_local_destination: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialQueueSettings {
    pub concurrency_limit: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub auto_acknowledge: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSubscriptionSettings {
    pub retry_interval_secs: Option<u64>,
    pub abandon_on_unauthorized: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                base_uri: "http://127.0.0.1:8080/".to_string(),
                bypass_local_destination: false,
            },
            queue: QueueSettings {
                concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
                auto_acknowledge: false,
            },
            subscription: SubscriptionSettings {
                retry_interval_secs: DEFAULT_RETRY_INTERVAL.as_secs(),
                abandon_on_unauthorized: false,
            },
            storage: StorageSettings {
                path: "data/busline".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            endpoints: HashMap::new(),
            subscriptions: Vec::new(),
            send_rules: Vec::new(),
        }
    }
}

impl Settings {
    /// Overlays the values present in `partial` onto `self`.
    pub fn merge(self, partial: PartialSettings) -> Self {
        let server = partial.server;
        let queue = partial.queue;
        let subscription = partial.subscription;
        Self {
            server: ServerSettings {
                base_uri: server
                    .as_ref()
                    .and_then(|s| s.base_uri.clone())
                    .unwrap_or(self.server.base_uri),
                bypass_local_destination: server
                    .as_ref()
                    .and_then(|s| s.bypass_local_destination)
                    .unwrap_or(self.server.bypass_local_destination),
            },
            queue: QueueSettings {
                concurrency_limit: queue
                    .as_ref()
                    .and_then(|q| q.concurrency_limit)
                    .unwrap_or(self.queue.concurrency_limit),
                max_attempts: queue
                    .as_ref()
                    .and_then(|q| q.max_attempts)
                    .unwrap_or(self.queue.max_attempts),
                retry_delay_ms: queue
                    .as_ref()
                    .and_then(|q| q.retry_delay_ms)
                    .unwrap_or(self.queue.retry_delay_ms),
                auto_acknowledge: queue
                    .as_ref()
                    .and_then(|q| q.auto_acknowledge)
                    .unwrap_or(self.queue.auto_acknowledge),
            },
            subscription: SubscriptionSettings {
                retry_interval_secs: subscription
                    .as_ref()
                    .and_then(|s| s.retry_interval_secs)
                    .unwrap_or(self.subscription.retry_interval_secs),
                abandon_on_unauthorized: subscription
                    .as_ref()
                    .and_then(|s| s.abandon_on_unauthorized)
                    .unwrap_or(self.subscription.abandon_on_unauthorized),
            },
            storage: StorageSettings {
                path: partial
                    .storage
                    .and_then(|s| s.path)
                    .unwrap_or(self.storage.path),
            },
            logging: LoggingSettings {
                level: partial
                    .logging
                    .and_then(|l| l.level)
                    .unwrap_or(self.logging.level),
            },
            endpoints: partial.endpoints.unwrap_or(self.endpoints),
            subscriptions: partial.subscriptions.unwrap_or(self.subscriptions),
            send_rules: partial.send_rules.unwrap_or(self.send_rules),
        }
    }
}
