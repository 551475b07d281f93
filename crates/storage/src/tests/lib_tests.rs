use super::*;
use chrono::Duration as ChronoDuration;

fn action_at(kind: ActionKind, priority: i32, queued_at: DateTime<Utc>) -> QueuedAction {
    QueuedAction {
        id: ActionId::generate(),
        kind,
        payload: serde_json::json!({ "conversation_id": 1, "body": "hi" }),
        priority,
        queued_at,
        retry_count: 0,
        last_attempt_at: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn round_trips_a_queued_action() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let queued = action_at(ActionKind::SendMessage, 3, Utc::now());
    store.enqueue_action(&queued).await.expect("enqueue");

    let loaded = store
        .get_action(queued.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded.id, queued.id);
    assert_eq!(loaded.kind, ActionKind::SendMessage);
    assert_eq!(loaded.priority, 3);
    assert_eq!(loaded.payload["body"], "hi");
    assert_eq!(loaded.retry_count, 0);
    assert!(loaded.last_attempt_at.is_none());
}

#[tokio::test]
async fn lists_pending_in_priority_then_fifo_order() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let base = Utc::now();

    let low = action_at(ActionKind::JoinConversation, 0, base);
    let urgent_old = action_at(ActionKind::SendMessage, 5, base + ChronoDuration::milliseconds(1));
    let urgent_new = action_at(ActionKind::SendMessage, 5, base + ChronoDuration::milliseconds(2));
    let mid = action_at(ActionKind::DeleteMessage, 1, base + ChronoDuration::milliseconds(3));

    for action in [&low, &urgent_new, &mid, &urgent_old] {
        store.enqueue_action(action).await.expect("enqueue");
    }

    let pending = store.list_pending().await.expect("list");
    let ids: Vec<ActionId> = pending.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![urgent_old.id, urgent_new.id, mid.id, low.id]);
}

#[tokio::test]
async fn record_attempt_increments_and_stamps() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let queued = action_at(ActionKind::UpdateMessage, 0, Utc::now());
    store.enqueue_action(&queued).await.expect("enqueue");

    let attempted_at = Utc::now();
    assert!(store
        .record_attempt(queued.id, attempted_at)
        .await
        .expect("attempt"));

    let loaded = store
        .get_action(queued.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded.retry_count, 1);
    assert_eq!(loaded.last_attempt_at, Some(attempted_at));

    assert!(!store
        .record_attempt(ActionId::generate(), attempted_at)
        .await
        .expect("missing attempt"));
}

#[tokio::test]
async fn delete_reports_whether_a_row_was_removed() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let queued = action_at(ActionKind::LeaveConversation, 0, Utc::now());
    store.enqueue_action(&queued).await.expect("enqueue");

    assert!(store.delete_action(queued.id).await.expect("delete"));
    assert!(!store.delete_action(queued.id).await.expect("redelete"));
    assert_eq!(store.count_actions().await.expect("count"), 0);
}

#[tokio::test]
async fn eviction_candidate_is_oldest_of_lowest_priority() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    let base = Utc::now();

    let urgent = action_at(ActionKind::SendMessage, 5, base);
    let low_old = action_at(ActionKind::JoinConversation, 0, base + ChronoDuration::milliseconds(1));
    let low_new = action_at(ActionKind::JoinConversation, 0, base + ChronoDuration::milliseconds(2));

    for action in [&urgent, &low_new, &low_old] {
        store.enqueue_action(action).await.expect("enqueue");
    }

    let candidate = store
        .eviction_candidate()
        .await
        .expect("candidate")
        .expect("non-empty queue");
    assert_eq!(candidate, low_old.id);
}

#[tokio::test]
async fn clear_all_empties_the_queue() {
    let store = OfflineStore::new("sqlite::memory:").await.expect("db");
    for i in 0..4 {
        store
            .enqueue_action(&action_at(ActionKind::SendMessage, i, Utc::now()))
            .await
            .expect("enqueue");
    }

    let removed = store.clear_all().await.expect("clear");
    assert_eq!(removed, 4);
    assert_eq!(store.count_actions().await.expect("count"), 0);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("queue.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = OfflineStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}
