use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{ActionId, ActionKind, ConnectionMode, QueuedAction},
    error::CoreError,
};
use storage::OfflineStore;

use crate::{config::QueueSettings, events::MessagingEvent};

/// Executes a replayed action against the live components. Implementations
/// must be idempotent per action id; the queue guarantees a single
/// in-flight attempt.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &QueuedAction) -> Result<()>;

    /// Called once when an action is dropped after exhausting its retries.
    async fn abandon(&self, _action: &QueuedAction) {}
}

pub fn default_priority(kind: ActionKind) -> i32 {
    match kind {
        ActionKind::SendMessage => 5,
        ActionKind::UpdateMessage | ActionKind::DeleteMessage => 3,
        ActionKind::JoinConversation | ActionKind::LeaveConversation => 1,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retried: usize,
}

/// Durable queue of actions that could not be completed immediately.
/// Replays them in `(priority DESC, queued_at ASC)` order with bounded,
/// backoff-gated retries.
pub struct OfflineActionQueue {
    store: OfflineStore,
    executor: Arc<dyn ActionExecutor>,
    events: broadcast::Sender<MessagingEvent>,
    settings: QueueSettings,
    mode: watch::Receiver<ConnectionMode>,
    draining: AtomicBool,
}

impl OfflineActionQueue {
    pub fn new(
        store: OfflineStore,
        executor: Arc<dyn ActionExecutor>,
        events: broadcast::Sender<MessagingEvent>,
        settings: QueueSettings,
        mode: watch::Receiver<ConnectionMode>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            events,
            settings,
            mode,
            draining: AtomicBool::new(false),
        })
    }

    /// Persists an action, evicting the oldest lowest-priority entry when
    /// at capacity, and schedules an immediate drain while online.
    pub async fn enqueue(
        self: &Arc<Self>,
        kind: ActionKind,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<ActionId, CoreError> {
        let count = self
            .store
            .count_actions()
            .await
            .map_err(|err| CoreError::StorageQuota {
                reason: err.to_string(),
            })?;
        if count >= self.settings.capacity {
            let victim = self
                .store
                .eviction_candidate()
                .await
                .ok()
                .flatten()
                .ok_or(CoreError::QueueFull)?;
            let _ = self.store.delete_action(victim).await;
            warn!(kind = ?kind, "queue at capacity, evicted oldest low-priority action");
        }

        let action = QueuedAction {
            id: ActionId::generate(),
            kind,
            payload,
            priority,
            queued_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
        };
        self.store
            .enqueue_action(&action)
            .await
            .map_err(|err| CoreError::StorageQuota {
                reason: err.to_string(),
            })?;
        info!(kind = ?kind, priority, "action queued");

        if *self.mode.borrow() != ConnectionMode::Offline {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.execute_pending().await;
            });
        }

        Ok(action.id)
    }

    /// Drains the queue once. Single-flight: a call while a drain is
    /// already running is a no-op.
    pub async fn execute_pending(self: &Arc<Self>) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return DrainReport::default();
        }
        let report = self.drain_once().await;
        self.draining.store(false, Ordering::SeqCst);
        report
    }

    async fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if *self.mode.borrow() == ConnectionMode::Offline {
            return report;
        }

        let pending = match self.store.list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!("queue drain aborted, store unreadable: {err}");
                return report;
            }
        };

        for action in pending {
            if action.retry_count >= self.settings.max_retries {
                let _ = self.store.delete_action(action.id).await;
                self.executor.abandon(&action).await;
                warn!(
                    kind = ?action.kind,
                    attempts = action.retry_count,
                    "action dropped after retry ceiling"
                );
                let _ = self.events.send(MessagingEvent::ActionDropped {
                    kind: action.kind,
                    attempts: action.retry_count,
                });
                report.failed += 1;
                continue;
            }

            if let Some(last_attempt) = action.last_attempt_at {
                let backoff_ms = self
                    .settings
                    .retry_backoff_ms
                    .saturating_mul(action.retry_count as u64);
                let elapsed_ms = (Utc::now() - last_attempt).num_milliseconds().max(0) as u64;
                if elapsed_ms < backoff_ms {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.executor.execute(&action).await {
                Ok(()) => {
                    let _ = self.store.delete_action(action.id).await;
                    report.executed += 1;
                }
                Err(err) => {
                    debug!(kind = ?action.kind, "action attempt failed: {err}");
                    let _ = self.store.record_attempt(action.id, Utc::now()).await;
                    report.retried += 1;
                }
            }
        }

        report
    }

    pub async fn count(&self) -> usize {
        self.store.count_actions().await.unwrap_or(0)
    }

    pub async fn clear_all(&self) -> u64 {
        self.store.clear_all().await.unwrap_or(0)
    }

    /// Watches for the offline-to-online transition and drains after a
    /// short settle delay.
    pub fn spawn_online_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut mode_rx = self.mode.clone();
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut was_offline = *mode_rx.borrow() == ConnectionMode::Offline;
            while mode_rx.changed().await.is_ok() {
                let offline_now = *mode_rx.borrow() == ConnectionMode::Offline;
                if was_offline && !offline_now {
                    tokio::time::sleep(queue.settings.settle_delay()).await;
                    let report = queue.execute_pending().await;
                    info!(
                        executed = report.executed,
                        failed = report.failed,
                        "queue drained after reconnect"
                    );
                }
                was_offline = offline_now;
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
