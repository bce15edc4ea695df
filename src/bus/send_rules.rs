//! Routing for messages sent without a `Destination`.
//!
//! A send rule maps a `MessageName` pattern to a configured endpoint name.
//! Every rule whose pattern matches contributes its endpoint; an endpoint
//! named by more than one matching rule is only used once.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct SendRule {
    pattern: Regex,
    endpoint: String,
}

impl SendRule {
    pub fn new(name_pattern: &str, endpoint: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(name_pattern)?,
            endpoint: endpoint.into(),
        })
    }

    pub fn matches(&self, message_name: &str) -> bool {
        self.pattern.is_match(message_name)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendRules {
    rules: Vec<SendRule>,
}

impl SendRules {
    pub fn new(rules: impl IntoIterator<Item = SendRule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Endpoint names for `message_name`, in rule order.
    pub fn endpoints_for(&self, message_name: &str) -> Vec<&str> {
        let mut endpoints: Vec<&str> = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.matches(message_name)) {
            if !endpoints.contains(&rule.endpoint()) {
                endpoints.push(rule.endpoint());
            }
        }
        endpoints
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
