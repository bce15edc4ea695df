//! The `message` module defines the immutable message envelope exchanged
//! between bus instances.
//!
//! A [`Message`] is a set of headers plus an opaque string payload. Once
//! built it is never modified; operations that need a different destination
//! or identity (for example fan-out to topic subscribers) produce a new
//! message instead.

pub mod headers;
pub mod principal;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub use headers::MessageHeaders;
pub use principal::SenderPrincipal;

/// Globally unique message identity, assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// A message travelling through the bus.
///
/// # Example
///
/// ```rust
/// use busline::message::{Message, MessageHeaders};
///
/// let mut headers = MessageHeaders::new();
/// headers.set_message_name("orders.created");
/// headers.set_content_type("application/json");
/// let msg = Message::new(headers, "{\"id\":42}");
/// assert_eq!(msg.headers().message_name(), Some("orders.created"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    headers: MessageHeaders,
    content: String,
}

impl Message {
    /// Builds a message, generating a `MessageId` header when the supplied
    /// headers do not carry a valid one.
    pub fn new(mut headers: MessageHeaders, content: impl Into<String>) -> Self {
        let id = match headers.message_id() {
            Some(id) => id,
            None => {
                let id = MessageId::generate();
                headers.set_message_id(id);
                id
            }
        };
        Self {
            id,
            headers,
            content: content.into(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Creates a copy of this message addressed to `destination` with a
    /// freshly generated identity.
    pub fn readdressed(&self, destination: &Url) -> Message {
        let mut headers = self.headers.clone();
        headers.set_message_id(MessageId::generate());
        headers.set_destination(destination);
        Message::new(headers, self.content.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.headers.expires().is_some_and(|expires| expires < now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
