mod settings;

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use url::Url;

use crate::bus::{SendRule, SendRules};
use crate::queue::QueueOptions;
use crate::subscription::LeaseOptions;
use crate::transport::{Endpoint, EndpointCollection, EndpointCredentials};

pub use settings::{
    EndpointSettings, LoggingSettings, PartialSettings, QueueSettings, SendRuleEntry, ServerSettings,
    Settings, StorageSettings, SubscriptionEntry, SubscriptionSettings,
};

/// Loads the configuration from `config/default` and the environment.
///
/// Environment variables use the `BUSLINE_` prefix and `__` between
/// nested keys, for example `BUSLINE_SERVER__BASE_URI`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file name (extension optional).
/// A missing file is not an error.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("BUSLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::default().merge(partial))
}

impl Settings {
    pub fn base_uri(&self) -> Result<Url, ConfigError> {
        parse_url("server.base_uri", &self.server.base_uri)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency_limit: self.queue.concurrency_limit,
            max_attempts: self.queue.max_attempts,
            retry_delay: Duration::from_millis(self.queue.retry_delay_ms),
            auto_acknowledge: self.queue.auto_acknowledge,
        }
        .normalized()
    }

    pub fn lease_options(&self) -> LeaseOptions {
        LeaseOptions {
            retry_interval: Duration::from_secs(self.subscription.retry_interval_secs),
            abandon_on_unauthorized: self.subscription.abandon_on_unauthorized,
        }
    }

    /// Builds the endpoint collection. A bearer token wins over basic
    /// credentials when both are configured.
    pub fn endpoint_collection(&self) -> Result<EndpointCollection, ConfigError> {
        let mut endpoints = Vec::with_capacity(self.endpoints.len());
        for (name, endpoint) in &self.endpoints {
            let address = parse_url(&format!("endpoints.{name}.address"), &endpoint.address)?;
            let mut built = Endpoint::new(name.clone(), address);
            if let Some(token) = &endpoint.token {
                built = built.with_credentials(EndpointCredentials::Bearer(token.clone()));
            } else if let Some(username) = &endpoint.username {
                built = built.with_credentials(EndpointCredentials::Basic {
                    username: username.clone(),
                    password: endpoint.password.clone().unwrap_or_default(),
                });
            }
            endpoints.push(built);
        }
        Ok(EndpointCollection::new(endpoints))
    }

    /// Compiles the configured send rules. Endpoint names are checked when
    /// a message is routed, not here.
    pub fn send_rules(&self) -> Result<SendRules, ConfigError> {
        let mut rules = Vec::with_capacity(self.send_rules.len());
        for (index, rule) in self.send_rules.iter().enumerate() {
            let compiled = SendRule::new(&rule.name_pattern, rule.endpoint.clone()).map_err(|e| {
                ConfigError::Message(format!(
                    "send_rules[{index}].name_pattern: invalid pattern {:?}: {e}",
                    rule.name_pattern
                ))
            })?;
            rules.push(compiled);
        }
        Ok(SendRules::new(rules))
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Message(format!("{key}: invalid URL {value:?}: {e}")))
}
