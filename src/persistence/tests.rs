use super::*;
use crate::message::MessageHeaders;
use chrono::Utc;
use tempfile::tempdir;

fn queued(queue: &QueueName, body: &str) -> QueuedMessage {
    QueuedMessage::new(
        queue.clone(),
        Message::new(MessageHeaders::new(), body),
        Some(SenderPrincipal::new("tester").with_claim("role", "sender")),
    )
}

async fn exercise_store(store: &dyn MessageQueueStore) {
    let queue = QueueName::from("orders");
    let first = queued(&queue, "one");
    let second = queued(&queue, "two");
    let third = queued(&queue, "three");

    for m in [&first, &second, &third] {
        assert_eq!(store.insert(m).await.unwrap(), m.id());
    }

    let pending = store.select_pending(&queue).await.unwrap();
    let bodies: Vec<_> = pending.iter().map(|m| m.message.content()).collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
    assert_eq!(pending[0].principal, first.principal);

    store.record_attempt(&queue, first.id(), 3).await.unwrap();

    let now = Utc::now();
    assert!(
        store
            .update_state(&queue, first.id(), QueuedMessageState::Acknowledged(now))
            .await
            .unwrap()
    );
    assert!(
        store
            .update_state(&queue, second.id(), QueuedMessageState::Abandoned(now))
            .await
            .unwrap()
    );

    // A terminal message cannot transition again.
    assert!(
        !store
            .update_state(&queue, first.id(), QueuedMessageState::Abandoned(now))
            .await
            .unwrap()
    );

    let pending = store.select_pending(&queue).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id(), third.id());

    let abandoned = store.select_abandoned(&queue).await.unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].abandoned_at(), Some(now));
    assert_eq!(abandoned[0].acknowledged_at(), None);

    let other = store.select_pending(&QueueName::from("other")).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_in_memory_store_lifecycle() {
    let store = InMemoryQueueStore::new();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_sled_store_lifecycle() {
    let dir = tempdir().unwrap();
    let store = SledQueueStore::open(dir.path().to_str().unwrap()).unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_duplicate_insert_is_rejected() {
    let store = InMemoryQueueStore::new();
    let queue = QueueName::from("dupes");
    let m = queued(&queue, "x");
    store.insert(&m).await.unwrap();
    assert!(matches!(store.insert(&m).await, Err(StoreError::Duplicate(_))));

    let dir = tempdir().unwrap();
    let sled = SledQueueStore::open(dir.path().to_str().unwrap()).unwrap();
    sled.insert(&m).await.unwrap();
    assert!(matches!(sled.insert(&m).await, Err(StoreError::Duplicate(_))));
}

#[tokio::test]
async fn test_sled_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let queue = QueueName::from("durable");
    let m = queued(&queue, "persisted");

    {
        let store = SledQueueStore::open(&path).unwrap();
        store.insert(&m).await.unwrap();
        store.record_attempt(&queue, m.id(), 2).await.unwrap();
    }

    let reopened = SledQueueStore::open(&path).unwrap();
    let pending = reopened.select_pending(&queue).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].message, m.message);
}

#[tokio::test]
async fn test_update_unknown_message_fails() {
    let store = InMemoryQueueStore::new();
    let queue = QueueName::from("empty");
    let result = store
        .update_state(&queue, MessageId::generate(), QueuedMessageState::Acknowledged(Utc::now()))
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}
