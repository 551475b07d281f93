use super::*;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

struct RecordingExecutor {
    executed: AsyncMutex<Vec<(ActionKind, serde_json::Value)>>,
    abandoned: AsyncMutex<Vec<ActionId>>,
    failing_kinds: Vec<ActionKind>,
    delay: Duration,
}

impl RecordingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: AsyncMutex::new(Vec::new()),
            abandoned: AsyncMutex::new(Vec::new()),
            failing_kinds: Vec::new(),
            delay: Duration::ZERO,
        })
    }

    fn failing(kinds: Vec<ActionKind>) -> Arc<Self> {
        Arc::new(Self {
            executed: AsyncMutex::new(Vec::new()),
            abandoned: AsyncMutex::new(Vec::new()),
            failing_kinds: kinds,
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            executed: AsyncMutex::new(Vec::new()),
            abandoned: AsyncMutex::new(Vec::new()),
            failing_kinds: Vec::new(),
            delay,
        })
    }
}

#[async_trait::async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &QueuedAction) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.executed
            .lock()
            .await
            .push((action.kind, action.payload.clone()));
        if self.failing_kinds.contains(&action.kind) {
            anyhow::bail!("handler rejected {:?}", action.kind);
        }
        Ok(())
    }

    async fn abandon(&self, action: &QueuedAction) {
        self.abandoned.lock().await.push(action.id);
    }
}

fn settings() -> QueueSettings {
    QueueSettings {
        capacity: 1_000,
        max_retries: 3,
        retry_backoff_ms: 0,
        drain_interval_ms: 60_000,
        settle_delay_ms: 10,
    }
}

async fn queue_with(
    executor: Arc<RecordingExecutor>,
    settings: QueueSettings,
    initial_mode: ConnectionMode,
) -> (
    Arc<OfflineActionQueue>,
    watch::Sender<ConnectionMode>,
    broadcast::Receiver<MessagingEvent>,
) {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let (mode_tx, mode_rx) = watch::channel(initial_mode);
    let (events_tx, events_rx) = broadcast::channel(64);
    let queue = OfflineActionQueue::new(store, executor, events_tx, settings, mode_rx);
    (queue, mode_tx, events_rx)
}

fn payload(seq: i64) -> serde_json::Value {
    serde_json::json!({ "seq": seq })
}

#[tokio::test]
async fn offline_drain_is_a_no_op() {
    let executor = RecordingExecutor::new();
    let (queue, _mode, _events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Offline).await;

    queue
        .enqueue(ActionKind::SendMessage, payload(1), 5)
        .await
        .expect("enqueue");

    let report = queue.execute_pending().await;
    assert_eq!(report, DrainReport::default());
    assert_eq!(queue.count().await, 1);
    assert!(executor.executed.lock().await.is_empty());
}

#[tokio::test]
async fn drains_by_priority_then_enqueue_order() {
    let executor = RecordingExecutor::new();
    // Built offline so no enqueue-triggered drain races the deliberate
    // drain below; the mode gate is checked per drain pass.
    let (queue, mode_tx, _events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Offline).await;

    queue
        .enqueue(ActionKind::JoinConversation, payload(1), 0)
        .await
        .expect("enqueue");
    queue
        .enqueue(ActionKind::SendMessage, payload(2), 5)
        .await
        .expect("enqueue");
    queue
        .enqueue(ActionKind::SendMessage, payload(3), 5)
        .await
        .expect("enqueue");
    queue
        .enqueue(ActionKind::DeleteMessage, payload(4), 3)
        .await
        .expect("enqueue");
    assert_eq!(queue.count().await, 4);

    mode_tx.send(ConnectionMode::Full).expect("mode change");
    queue.execute_pending().await;
    assert_eq!(queue.count().await, 0);

    let executed = executor.executed.lock().await.clone();
    let sequence: Vec<i64> = executed
        .iter()
        .map(|(_, payload)| payload["seq"].as_i64().expect("seq"))
        .collect();
    assert_eq!(sequence, vec![2, 3, 4, 1]);
}

#[tokio::test]
async fn failing_action_is_attempted_exactly_max_retries_times() {
    let executor = RecordingExecutor::failing(vec![ActionKind::SendMessage]);
    let (queue, mode_tx, mut events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Offline).await;

    queue
        .enqueue(ActionKind::SendMessage, payload(1), 5)
        .await
        .expect("enqueue");
    mode_tx.send(ConnectionMode::Full).expect("mode change");

    for _ in 0..5 {
        queue.execute_pending().await;
    }

    let attempts = executor.executed.lock().await.len();
    assert_eq!(attempts, 3, "exactly max_retries attempts, no more");
    assert_eq!(queue.count().await, 0, "exhausted action is removed");
    assert_eq!(executor.abandoned.lock().await.len(), 1);

    let mut dropped = None;
    while let Ok(event) = events.try_recv() {
        if let MessagingEvent::ActionDropped { kind, attempts } = event {
            dropped = Some((kind, attempts));
        }
    }
    assert_eq!(dropped, Some((ActionKind::SendMessage, 3)));
}

#[tokio::test]
async fn backoff_window_defers_recent_failures() {
    let executor = RecordingExecutor::failing(vec![ActionKind::SendMessage]);
    let (queue, _mode, _events) = queue_with(
        Arc::clone(&executor),
        QueueSettings {
            retry_backoff_ms: 60_000,
            ..settings()
        },
        ConnectionMode::Full,
    )
    .await;

    queue
        .enqueue(ActionKind::SendMessage, payload(1), 5)
        .await
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The enqueue-triggered drain made the first attempt; the next drain
    // lands inside the backoff window and must skip.
    let report = queue.execute_pending().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(executor.executed.lock().await.len(), 1);
}

#[tokio::test]
async fn drain_is_single_flight() {
    let executor = RecordingExecutor::slow(Duration::from_millis(100));
    let (queue, mode_tx, _events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Offline).await;
    queue
        .enqueue(ActionKind::SendMessage, payload(1), 5)
        .await
        .expect("enqueue");
    mode_tx.send(ConnectionMode::Full).expect("mode change");

    let first = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.execute_pending().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let overlapping = queue.execute_pending().await;
    assert_eq!(
        overlapping,
        DrainReport::default(),
        "re-entrant drain is a no-op"
    );

    let first = first.await.expect("join");
    assert_eq!(first.executed, 1);
    assert!(executor.executed.lock().await.len() == 1);
}

#[tokio::test]
async fn capacity_eviction_drops_oldest_lowest_priority() {
    let executor = RecordingExecutor::new();
    let (queue, _mode, _events) = queue_with(
        Arc::clone(&executor),
        QueueSettings {
            capacity: 2,
            ..settings()
        },
        ConnectionMode::Offline,
    )
    .await;

    queue
        .enqueue(ActionKind::JoinConversation, payload(1), 0)
        .await
        .expect("enqueue");
    queue
        .enqueue(ActionKind::SendMessage, payload(2), 5)
        .await
        .expect("enqueue");
    queue
        .enqueue(ActionKind::SendMessage, payload(3), 5)
        .await
        .expect("enqueue");

    assert_eq!(queue.count().await, 2, "eviction keeps the queue at capacity");
}

#[tokio::test]
async fn enqueue_while_online_drains_immediately() {
    let executor = RecordingExecutor::new();
    let (queue, _mode, _events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Full).await;

    queue
        .enqueue(ActionKind::SendMessage, payload(9), 5)
        .await
        .expect("enqueue");

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if queue.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("enqueue must trigger a drain while online");
    assert_eq!(executor.executed.lock().await.len(), 1);
}

#[tokio::test]
async fn reconnect_triggers_drain_after_settle_delay() {
    let executor = RecordingExecutor::new();
    let (queue, mode_tx, _events) =
        queue_with(Arc::clone(&executor), settings(), ConnectionMode::Offline).await;

    for seq in 1..=3 {
        queue
            .enqueue(ActionKind::SendMessage, payload(seq), 5)
            .await
            .expect("enqueue");
    }
    assert_eq!(queue.count().await, 3, "offline sends are persisted");

    let _watcher = queue.spawn_online_watcher();
    mode_tx.send(ConnectionMode::Full).expect("mode change");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if queue.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue must drain after coming online");

    let executed = executor.executed.lock().await.clone();
    let sequence: Vec<i64> = executed
        .iter()
        .map(|(_, payload)| payload["seq"].as_i64().expect("seq"))
        .collect();
    assert_eq!(sequence, vec![1, 2, 3], "equal priority drains in enqueue order");
}

#[tokio::test]
async fn clear_all_discards_the_backlog() {
    let executor = RecordingExecutor::new();
    let (queue, _mode, _events) =
        queue_with(executor, settings(), ConnectionMode::Offline).await;

    for seq in 0..5 {
        queue
            .enqueue(ActionKind::SendMessage, payload(seq), 1)
            .await
            .expect("enqueue");
    }
    assert_eq!(queue.clear_all().await, 5);
    assert_eq!(queue.count().await, 0);
}
