use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::MessageId;

pub const MESSAGE_ID: &str = "MessageId";
pub const MESSAGE_NAME: &str = "MessageName";
pub const ORIGINATION: &str = "Origination";
pub const DESTINATION: &str = "Destination";
pub const REPLY_TO: &str = "ReplyTo";
pub const EXPIRES: &str = "Expires";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const SYNCHRONOUS: &str = "Synchronous";

/// Ordered collection of message headers.
///
/// Header names keep the casing they were first set with but are compared
/// case-insensitively, so `content-type` and `Content-Type` address the same
/// entry. Insertion order is preserved, which is also the order headers are
/// written onto outbound requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    entries: Vec<(String, String)>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets a header, replacing the value of an existing entry with the same
    /// name (ignoring case) in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.get(MESSAGE_ID).and_then(|v| v.parse().ok())
    }

    pub fn set_message_id(&mut self, id: MessageId) {
        self.set(MESSAGE_ID, id.to_string());
    }

    pub fn message_name(&self) -> Option<&str> {
        self.get(MESSAGE_NAME)
    }

    pub fn set_message_name(&mut self, name: impl Into<String>) {
        self.set(MESSAGE_NAME, name);
    }

    pub fn origination(&self) -> Option<Url> {
        self.get_url(ORIGINATION)
    }

    pub fn set_origination(&mut self, uri: &Url) {
        self.set(ORIGINATION, uri.as_str());
    }

    pub fn destination(&self) -> Option<Url> {
        self.get_url(DESTINATION)
    }

    pub fn set_destination(&mut self, uri: &Url) {
        self.set(DESTINATION, uri.as_str());
    }

    pub fn reply_to(&self) -> Option<Url> {
        self.get_url(REPLY_TO)
    }

    pub fn set_reply_to(&mut self, uri: &Url) {
        self.set(REPLY_TO, uri.as_str());
    }

    /// Expiration timestamp, stored in RFC 3339 form.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.get(EXPIRES)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_expires(&mut self, expires: DateTime<Utc>) {
        self.set(EXPIRES, expires.to_rfc3339());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set(CONTENT_TYPE, content_type);
    }

    pub fn synchronous(&self) -> bool {
        self.get(SYNCHRONOUS)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn set_synchronous(&mut self, synchronous: bool) {
        self.set(SYNCHRONOUS, if synchronous { "true" } else { "false" });
    }

    fn get_url(&self, name: &str) -> Option<Url> {
        self.get(name).and_then(|v| Url::parse(v).ok())
    }
}

impl<K, V> FromIterator<(K, V)> for MessageHeaders
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = MessageHeaders::new();
        for (name, value) in iter {
            headers.set(name, value);
        }
        headers
    }
}
