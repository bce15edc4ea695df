//! Journal backed by `sled`
//!
//! Entries live in a single `journal` tree keyed by big-endian positions
//! drawn from `Db::generate_id`, so iteration order is append order.
//! Positions are strictly increasing but may skip values after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use super::{JournalCategory, JournalEntry, JournalError, JournalFilter, JournalReadResult, MessageJournal};
use crate::message::Message;

const TREE: &str = "journal";

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    category: JournalCategory,
    timestamp: DateTime<Utc>,
    message: Message,
}

#[derive(Clone)]
pub struct SledMessageJournal {
    db: Db,
    tree: Tree,
}

impl SledMessageJournal {
    pub fn open(path: &str) -> Result<Self, JournalError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn from_db(db: Db) -> Result<Self, JournalError> {
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }
}

fn decode_position(key: &[u8]) -> Result<u64, JournalError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| JournalError::Unavailable("malformed journal key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

async fn blocking<T, F>(f: F) -> Result<T, JournalError>
where
    F: FnOnce() -> Result<T, JournalError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JournalError::Unavailable(e.to_string()))?
}

#[async_trait]
impl MessageJournal for SledMessageJournal {
    async fn append(&self, message: &Message, category: JournalCategory) -> Result<(), JournalError> {
        let journal = self.clone();
        let record = StoredEntry {
            category,
            timestamp: Utc::now(),
            message: message.clone(),
        };
        blocking(move || {
            let position = journal.db.generate_id()?;
            journal
                .tree
                .insert(position.to_be_bytes(), serde_json::to_vec(&record)?)?;
            journal.tree.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(
        &self,
        start: u64,
        count: usize,
        filter: &JournalFilter,
    ) -> Result<JournalReadResult, JournalError> {
        let journal = self.clone();
        let filter = filter.clone();
        blocking(move || {
            let mut selected = Vec::new();
            let mut next = start;
            let mut entries = journal.tree.range(start.to_be_bytes()..);
            while selected.len() < count {
                let Some(item) = entries.next() else {
                    break;
                };
                let (key, value) = item?;
                let position = decode_position(&key)?;
                let stored: StoredEntry = serde_json::from_slice(&value)?;
                next = position + 1;
                let entry = JournalEntry {
                    position,
                    category: stored.category,
                    timestamp: stored.timestamp,
                    message: stored.message,
                };
                if filter.matches(&entry) {
                    selected.push(entry);
                }
            }
            let end_of_journal = journal.tree.range(next.to_be_bytes()..).next().is_none();
            Ok(JournalReadResult {
                start,
                next,
                end_of_journal,
                entries: selected,
            })
        })
        .await
    }
}

impl std::fmt::Debug for SledMessageJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledMessageJournal")
            .field("tree", &TREE)
            .finish()
    }
}
