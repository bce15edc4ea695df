//! The `journal` module records message events for later inspection.
//!
//! The transport appends every message it is about to send to the `Sent`
//! category. Entries are never changed afterwards: a send that later fails
//! stays in the journal, and the failure is reported through diagnostics.
//!
//! [`SledMessageJournal`] keeps entries across restarts and is what a bus
//! uses; [`InMemoryMessageJournal`] is for tests and throwaway instances.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

pub mod sled_journal;

pub use sled_journal::SledMessageJournal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalCategory {
    Sent,
    Received,
    Published,
}

impl fmt::Display for JournalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JournalCategory::Sent => "Sent",
            JournalCategory::Received => "Received",
            JournalCategory::Published => "Published",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Unavailable(String),
    #[error("journal storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode or decode journal entry: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessageJournal: Send + Sync {
    async fn append(&self, message: &Message, category: JournalCategory) -> Result<(), JournalError>;

    /// Reads up to `count` matching entries starting at position `start`.
    /// `next` in the result is where the following page starts.
    async fn read(
        &self,
        start: u64,
        count: usize,
        filter: &JournalFilter,
    ) -> Result<JournalReadResult, JournalError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub position: u64,
    pub category: JournalCategory,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
}

/// Restricts a journal read to some categories or a message name.
#[derive(Debug, Clone, Default)]
pub struct JournalFilter {
    pub categories: Vec<JournalCategory>,
    pub message_name: Option<String>,
}

impl JournalFilter {
    fn matches(&self, entry: &JournalEntry) -> bool {
        let category_ok = self.categories.is_empty() || self.categories.contains(&entry.category);
        let name_ok = self
            .message_name
            .as_deref()
            .is_none_or(|name| entry.message.headers().message_name() == Some(name));
        category_ok && name_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalReadResult {
    pub start: u64,
    pub next: u64,
    pub end_of_journal: bool,
    pub entries: Vec<JournalEntry>,
}

/// Append-only journal kept in memory. Positions start at zero and grow by
/// one per entry.
#[derive(Debug, Default)]
pub struct InMemoryMessageJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl InMemoryMessageJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageJournal for InMemoryMessageJournal {
    async fn append(&self, message: &Message, category: JournalCategory) -> Result<(), JournalError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| JournalError::Unavailable(e.to_string()))?;
        let position = entries.len() as u64;
        entries.push(JournalEntry {
            position,
            category,
            timestamp: Utc::now(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn read(
        &self,
        start: u64,
        count: usize,
        filter: &JournalFilter,
    ) -> Result<JournalReadResult, JournalError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut selected = Vec::new();
        let mut next = start;
        for entry in entries.iter().skip(start as usize) {
            if selected.len() == count {
                break;
            }
            next = entry.position + 1;
            if filter.matches(entry) {
                selected.push(entry.clone());
            }
        }
        Ok(JournalReadResult {
            start,
            next,
            end_of_journal: next >= entries.len() as u64,
            entries: selected,
        })
    }
}
