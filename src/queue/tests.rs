use super::*;
use crate::diagnostics::{self, DiagnosticEventKind, DiagnosticLog};
use crate::message::{MessageHeaders, MessageId};
use crate::persistence::{
    InMemoryQueueStore, MessageQueueStore, QueuedMessage, QueuedMessageState, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Behavior {
    /// Acknowledge from the given attempt onwards.
    AckOnAttempt(u32),
    /// Return `Ok` without acknowledging.
    Succeed,
    /// Reject explicitly, then return `Ok`.
    Reject,
    /// Return `Err` until the given attempt, then acknowledge.
    ErrorUntil(u32),
    Panic,
}

struct TestListener {
    behavior: Behavior,
    delay: Duration,
    calls: Mutex<HashMap<MessageId, u32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TestListener {
    fn new(behavior: Behavior) -> Arc<Self> {
        Self::with_delay(behavior, Duration::ZERO)
    }

    fn with_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            delay,
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn calls_for(&self, id: MessageId) -> u32 {
        self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl QueueListener for TestListener {
    async fn message_received(
        &self,
        message: &Message,
        context: &QueuedMessageContext,
        _cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        *self.calls.lock().unwrap().entry(message.id()).or_insert(0) += 1;
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match self.behavior {
            Behavior::AckOnAttempt(n) => {
                if context.attempt() >= n {
                    context.acknowledge();
                }
                Ok(())
            }
            Behavior::Succeed => Ok(()),
            Behavior::Reject => {
                context.reject();
                Ok(())
            }
            Behavior::ErrorUntil(n) => {
                if context.attempt() < n {
                    return Err("handler failed".into());
                }
                context.acknowledge();
                Ok(())
            }
            Behavior::Panic => panic!("listener blew up"),
        }
    }
}

/// Store whose inserts always fail.
struct BrokenStore;

#[async_trait]
impl MessageQueueStore for BrokenStore {
    async fn insert(&self, _queued: &QueuedMessage) -> Result<MessageId, StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }

    async fn select_pending(&self, _queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        Ok(Vec::new())
    }

    async fn select_abandoned(&self, _queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        Ok(Vec::new())
    }

    async fn record_attempt(
        &self,
        _queue: &QueueName,
        _id: MessageId,
        _attempts: u32,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_state(
        &self,
        _queue: &QueueName,
        _id: MessageId,
        _state: QueuedMessageState,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }
}

/// In-memory store whose attempt and state writes fail while `failing` is set.
struct FlakyStore {
    inner: InMemoryQueueStore,
    failing: std::sync::atomic::AtomicBool,
    failed_state_writes: AtomicUsize,
}

impl FlakyStore {
    fn failing() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryQueueStore::new(),
            failing: std::sync::atomic::AtomicBool::new(true),
            failed_state_writes: AtomicUsize::new(0),
        })
    }

    fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    fn get(&self, id: MessageId) -> QueuedMessage {
        self.inner.get(&QueueName::from("test"), id).expect("message stored")
    }
}

#[async_trait]
impl MessageQueueStore for FlakyStore {
    async fn insert(&self, queued: &QueuedMessage) -> Result<MessageId, StoreError> {
        self.inner.insert(queued).await
    }

    async fn select_pending(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        self.inner.select_pending(queue).await
    }

    async fn select_abandoned(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, StoreError> {
        self.inner.select_abandoned(queue).await
    }

    async fn record_attempt(
        &self,
        queue: &QueueName,
        id: MessageId,
        attempts: u32,
    ) -> Result<(), StoreError> {
        if self.is_failing() {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        self.inner.record_attempt(queue, id, attempts).await
    }

    async fn update_state(
        &self,
        queue: &QueueName,
        id: MessageId,
        state: QueuedMessageState,
    ) -> Result<bool, StoreError> {
        if self.is_failing() {
            self.failed_state_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("store offline".into()));
        }
        self.inner.update_state(queue, id, state).await
    }
}

/// Waits for cancellation and then returns `Ok` without deciding.
struct UntilCancelled {
    calls: AtomicUsize,
}

#[async_trait]
impl QueueListener for UntilCancelled {
    async fn message_received(
        &self,
        _message: &Message,
        _context: &QueuedMessageContext,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Ok(())
    }
}

fn options(max_attempts: u32) -> QueueOptions {
    QueueOptions {
        concurrency_limit: 4,
        max_attempts,
        retry_delay: Duration::from_millis(10),
        auto_acknowledge: false,
    }
}

fn message(body: &str) -> Message {
    Message::new(MessageHeaders::new(), body)
}

fn new_queue(
    store: &Arc<InMemoryQueueStore>,
    listener: Arc<TestListener>,
    options: QueueOptions,
) -> MessageQueue {
    MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener,
        options,
        diagnostics::noop(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn stored(store: &InMemoryQueueStore, id: MessageId) -> QueuedMessage {
    store.get(&QueueName::from("test"), id).expect("message stored")
}

#[tokio::test]
async fn test_acknowledged_message_is_terminal() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::AckOnAttempt(1));
    let queue = new_queue(&store, listener.clone(), options(3));
    queue.init().await.unwrap();

    let id = queue.enqueue(message("hello"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;

    let queued = stored(&store, id);
    assert_eq!(queued.attempts, 1);
    assert!(queued.acknowledged_at().is_some());
    assert!(queued.abandoned_at().is_none());
    assert_eq!(listener.calls_for(id), 1);
}

#[tokio::test]
async fn test_pending_message_has_no_terminal_timestamps() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::Succeed);
    let queue = new_queue(&store, listener, options(3));

    // Not initialized: persisted but never delivered.
    let id = queue.enqueue(message("waiting"), None).await.unwrap();
    let queued = stored(&store, id);
    assert_eq!(queued.state, QueuedMessageState::Pending);
    assert_eq!(queued.attempts, 0);
    assert!(queued.acknowledged_at().is_none());
    assert!(queued.abandoned_at().is_none());
}

#[tokio::test]
async fn test_never_acknowledged_message_is_abandoned_after_max_attempts() {
    let store = Arc::new(InMemoryQueueStore::new());
    let log = Arc::new(DiagnosticLog::new());
    let listener = TestListener::new(Behavior::Succeed);
    let queue = MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener.clone(),
        options(3),
        log.clone(),
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("doomed"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = stored(&store, id);
    assert_eq!(listener.calls_for(id), 3);
    assert_eq!(queued.attempts, 3);
    assert!(queued.abandoned_at().is_some());
    assert!(queued.acknowledged_at().is_none());
    assert_eq!(log.count(DiagnosticEventKind::MessageAbandoned), 1);
    assert_eq!(queue.abandoned().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_auto_acknowledge_acknowledges_successful_invocation() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::Succeed);
    let queue = new_queue(
        &store,
        listener.clone(),
        QueueOptions {
            auto_acknowledge: true,
            ..options(3)
        },
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("auto"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;
    assert!(stored(&store, id).acknowledged_at().is_some());
    assert_eq!(listener.calls_for(id), 1);
}

#[tokio::test]
async fn test_rejection_suppresses_auto_acknowledge() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::Reject);
    let queue = new_queue(
        &store,
        listener.clone(),
        QueueOptions {
            auto_acknowledge: true,
            ..options(2)
        },
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("rejected"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;
    assert!(stored(&store, id).abandoned_at().is_some());
    assert_eq!(listener.calls_for(id), 2);
}

#[tokio::test]
async fn test_listener_error_is_retried() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::ErrorUntil(3));
    let queue = new_queue(&store, listener.clone(), options(5));
    queue.init().await.unwrap();

    let id = queue.enqueue(message("flaky"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;

    let queued = stored(&store, id);
    assert_eq!(queued.attempts, 3);
    assert!(queued.acknowledged_at().is_some());
}

#[tokio::test]
async fn test_listener_panic_does_not_stop_the_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::new(Behavior::Panic);
    let queue = new_queue(&store, listener.clone(), options(2));
    queue.init().await.unwrap();

    let first = queue.enqueue(message("one"), None).await.unwrap();
    let second = queue.enqueue(message("two"), None).await.unwrap();
    wait_until(|| {
        stored(&store, first).state.is_terminal() && stored(&store, second).state.is_terminal()
    })
    .await;

    assert!(stored(&store, first).abandoned_at().is_some());
    assert!(stored(&store, second).abandoned_at().is_some());
    assert_eq!(listener.total_calls(), 4);
}

#[tokio::test]
async fn test_concurrency_limit_caps_active_listeners() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = TestListener::with_delay(Behavior::AckOnAttempt(1), Duration::from_millis(30));
    let queue = new_queue(
        &store,
        listener.clone(),
        QueueOptions {
            concurrency_limit: 2,
            ..options(3)
        },
    );
    queue.init().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(queue.enqueue(message(&format!("m{i}")), None).await.unwrap());
    }
    wait_until(|| ids.iter().all(|id| stored(&store, *id).state.is_terminal())).await;

    let max = listener.max_active.load(Ordering::SeqCst);
    assert!(max <= 2, "observed {max} concurrent listener invocations");
    assert!(max >= 1);
    assert_eq!(listener.total_calls(), 8);
}

#[tokio::test]
async fn test_double_init_does_not_duplicate_backlog_delivery() {
    let store = Arc::new(InMemoryQueueStore::new());
    let name = QueueName::from("test");
    let mut ids = Vec::new();
    for i in 0..3 {
        let queued = QueuedMessage::new(name.clone(), message(&format!("backlog{i}")), None);
        ids.push(store.insert(&queued).await.unwrap());
    }

    let listener = TestListener::with_delay(Behavior::AckOnAttempt(1), Duration::from_millis(10));
    let queue = new_queue(&store, listener.clone(), options(3));
    let (a, b) = tokio::join!(queue.init(), queue.init());
    a.unwrap();
    b.unwrap();
    queue.init().await.unwrap();

    wait_until(|| ids.iter().all(|id| stored(&store, *id).state.is_terminal())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for id in &ids {
        assert_eq!(listener.calls_for(*id), 1);
    }
}

#[tokio::test]
async fn test_reinit_redelivers_only_pending_messages() {
    let store = Arc::new(InMemoryQueueStore::new());
    let name = QueueName::from("test");
    let pending = QueuedMessage::new(name.clone(), message("pending"), None);
    let acked = QueuedMessage::new(name.clone(), message("acked"), None);
    let abandoned = QueuedMessage::new(name.clone(), message("abandoned"), None);
    for m in [&pending, &acked, &abandoned] {
        store.insert(m).await.unwrap();
    }
    let now = chrono::Utc::now();
    store
        .update_state(&name, acked.id(), QueuedMessageState::Acknowledged(now))
        .await
        .unwrap();
    store
        .update_state(&name, abandoned.id(), QueuedMessageState::Abandoned(now))
        .await
        .unwrap();

    let listener = TestListener::new(Behavior::AckOnAttempt(1));
    let queue = new_queue(&store, listener.clone(), options(3));
    queue.init().await.unwrap();

    wait_until(|| stored(&store, pending.id()).state.is_terminal()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.calls_for(pending.id()), 1);
    assert_eq!(listener.calls_for(acked.id()), 0);
    assert_eq!(listener.calls_for(abandoned.id()), 0);
}

#[tokio::test]
async fn test_shutdown_leaves_message_pending_for_next_init() {
    let store = Arc::new(InMemoryQueueStore::new());
    let stubborn = TestListener::new(Behavior::Succeed);
    let first = new_queue(
        &store,
        stubborn.clone(),
        QueueOptions {
            retry_delay: Duration::from_secs(60),
            ..options(5)
        },
    );
    first.init().await.unwrap();
    let id = first.enqueue(message("survivor"), None).await.unwrap();
    wait_until(|| stubborn.calls_for(id) == 1).await;

    // Cancels the 60 second retry wait.
    first.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stored(&store, id).state, QueuedMessageState::Pending);
    assert_eq!(stubborn.calls_for(id), 1);
    drop(first);

    let acking = TestListener::new(Behavior::AckOnAttempt(1));
    let second = new_queue(&store, acking.clone(), options(5));
    second.init().await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;

    let queued = stored(&store, id);
    assert!(queued.acknowledged_at().is_some());
    assert_eq!(queued.attempts, 2);
    assert_eq!(acking.calls_for(id), 1);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_reports_closed_buffer() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = new_queue(&store, TestListener::new(Behavior::Succeed), options(3));
    queue.init().await.unwrap();
    queue.shutdown();

    let msg = message("late");
    let id = msg.id();
    let result = queue.enqueue(msg, None).await;
    assert!(matches!(result, Err(QueueError::BufferClosed(_))));
    assert_eq!(stored(&store, id).state, QueuedMessageState::Pending);
}

#[tokio::test]
async fn test_enqueue_propagates_persistence_failure() {
    let queue = MessageQueue::new(
        QueueName::from("broken"),
        Arc::new(BrokenStore),
        TestListener::new(Behavior::Succeed),
        options(3),
        diagnostics::noop(),
    );
    queue.init().await.unwrap();
    let result = queue.enqueue(message("lost"), None).await;
    assert!(matches!(
        result,
        Err(QueueError::Persistence(StoreError::Unavailable(_)))
    ));
}

#[tokio::test]
async fn test_context_carries_sender_principal() {
    struct PrincipalListener(Mutex<Option<String>>);

    #[async_trait]
    impl QueueListener for PrincipalListener {
        async fn message_received(
            &self,
            _message: &Message,
            context: &QueuedMessageContext,
            _cancel: CancellationToken,
        ) -> Result<(), BoxError> {
            *self.0.lock().unwrap() = context.principal().map(|p| p.name.clone());
            context.acknowledge();
            Ok(())
        }
    }

    let store = Arc::new(InMemoryQueueStore::new());
    let listener = Arc::new(PrincipalListener(Mutex::new(None)));
    let queue = MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener.clone(),
        options(1),
        diagnostics::noop(),
    );
    queue.init().await.unwrap();
    let id = queue
        .enqueue(message("signed"), Some(crate::message::SenderPrincipal::new("carol")))
        .await
        .unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;
    assert_eq!(listener.0.lock().unwrap().as_deref(), Some("carol"));
}

#[tokio::test]
async fn test_queueing_service_routes_by_name() {
    let store = Arc::new(InMemoryQueueStore::new());
    let service = QueueingService::new(store.clone(), diagnostics::noop());
    let listener = TestListener::new(Behavior::AckOnAttempt(1));
    let name = QueueName::from("test");

    service
        .create_queue(name.clone(), listener.clone(), options(3))
        .await
        .unwrap();
    let duplicate = service
        .create_queue(name.clone(), listener.clone(), options(3))
        .await;
    assert!(matches!(duplicate, Err(QueueError::QueueAlreadyExists(_))));

    let missing = service
        .enqueue_message(&QueueName::from("nope"), message("x"), None)
        .await;
    assert!(matches!(missing, Err(QueueError::QueueNotFound(_))));

    let id = service.enqueue_message(&name, message("routed"), None).await.unwrap();
    wait_until(|| stored(&store, id).state.is_terminal()).await;
    assert_eq!(listener.calls_for(id), 1);
    service.shutdown();
}

#[test]
fn test_default_options() {
    let options = QueueOptions::default();
    assert_eq!(options.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
    assert_eq!(options.max_attempts, 10);
    assert!(!options.auto_acknowledge);

    let normalized = QueueOptions {
        concurrency_limit: 0,
        max_attempts: 0,
        ..QueueOptions::default()
    }
    .normalized();
    assert_eq!(normalized.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
    assert_eq!(normalized.max_attempts, DEFAULT_MAX_ATTEMPTS);
}

#[tokio::test]
async fn test_failed_state_write_leaves_message_pending_until_store_recovers() {
    let store = FlakyStore::failing();
    let log = Arc::new(DiagnosticLog::new());
    let listener = TestListener::new(Behavior::AckOnAttempt(1));
    let queue = MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener.clone(),
        options(10),
        log.clone(),
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("persist me"), None).await.unwrap();

    // Every acknowledgement so far failed to persist, so the listener runs again.
    wait_until(|| listener.calls_for(id) >= 2).await;
    assert_eq!(store.get(id).state, QueuedMessageState::Pending);
    assert!(log.count(DiagnosticEventKind::QueueStoreError) >= 2);

    store.recover();
    wait_until(|| store.get(id).state.is_terminal()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = store.get(id);
    assert!(queued.acknowledged_at().is_some());
    assert!(listener.calls_for(id) >= 2);
    assert_eq!(log.count(DiagnosticEventKind::MessageAcknowledged), 1);
}

#[tokio::test]
async fn test_failed_abandon_write_does_not_invoke_listener_again() {
    let store = FlakyStore::failing();
    let listener = TestListener::new(Behavior::Succeed);
    let queue = MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener.clone(),
        options(2),
        diagnostics::noop(),
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("bounded"), None).await.unwrap();
    wait_until(|| store.failed_state_writes.load(Ordering::SeqCst) >= 3).await;
    assert_eq!(listener.calls_for(id), 2);
    assert_eq!(store.get(id).state, QueuedMessageState::Pending);

    store.recover();
    wait_until(|| store.get(id).state.is_terminal()).await;
    assert!(store.get(id).abandoned_at().is_some());
    assert_eq!(listener.calls_for(id), 2);
}

#[tokio::test]
async fn test_shutdown_during_invocation_is_not_auto_acknowledged() {
    let store = Arc::new(InMemoryQueueStore::new());
    let listener = Arc::new(UntilCancelled {
        calls: AtomicUsize::new(0),
    });
    let queue = MessageQueue::new(
        QueueName::from("test"),
        store.clone(),
        listener.clone(),
        QueueOptions {
            auto_acknowledge: true,
            ..options(1)
        },
        diagnostics::noop(),
    );
    queue.init().await.unwrap();

    let id = queue.enqueue(message("in flight"), None).await.unwrap();
    wait_until(|| listener.calls.load(Ordering::SeqCst) == 1).await;

    queue.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Neither acknowledged nor abandoned, although this was the last allowed attempt.
    assert_eq!(stored(&store, id).state, QueuedMessageState::Pending);
}
