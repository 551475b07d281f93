use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;

use shared::{
    domain::{
        ActionKind, ConnectionMode, ConversationId, Message, MessageId, PendingId, QueuedAction,
    },
    error::{CoreError, ErrorClass},
    protocol::NewMessage,
};
use storage::OfflineStore;

use crate::{
    adaptive::{
        timings, AdaptiveConnectionController, EnvironmentSignals, HEARTBEAT_JOB, QUEUE_DRAIN_JOB,
        TYPING_SWEEP_JOB,
    },
    channel::{ChannelManager, ConversationSubscription},
    config::MessagingConfig,
    delivery::{DeliveryTracker, LocalProfile, SendRequest},
    events::MessagingEvent,
    queue::{default_priority, ActionExecutor, OfflineActionQueue},
    scheduler::{job, Scheduler},
    store::MessageStore,
    transport::RealtimeTransport,
    typing::{TypingBroadcast, TypingIndicatorManager},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessagePayload {
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessagePayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub conversation_id: ConversationId,
}

/// The composition root: one explicit context object wires every
/// component together at process start and is passed by `Arc` to
/// collaborators. There are no process-global singletons.
pub struct MessagingContext {
    config: MessagingConfig,
    profile: LocalProfile,
    store: Arc<dyn MessageStore>,
    pub delivery: Arc<DeliveryTracker>,
    pub typing: Arc<TypingIndicatorManager>,
    pub queue: Arc<OfflineActionQueue>,
    pub channels: Arc<ChannelManager>,
    pub scheduler: Arc<Scheduler>,
    pub signals: EnvironmentSignals,
    mode_rx: watch::Receiver<ConnectionMode>,
    events_tx: broadcast::Sender<MessagingEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl MessagingContext {
    pub async fn new(
        config: MessagingConfig,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn MessageStore>,
        offline_store: OfflineStore,
        profile: LocalProfile,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        let (mode_tx, mode_rx) = watch::channel(ConnectionMode::Full);
        let scheduler = Scheduler::new();

        let (typing_tx, mut typing_rx) = mpsc::channel::<TypingBroadcast>(64);
        let typing = TypingIndicatorManager::new(
            profile.clone(),
            config.typing.clone(),
            events_tx.clone(),
            typing_tx,
        );
        let delivery = DeliveryTracker::new(
            Arc::clone(&store),
            events_tx.clone(),
            profile.clone(),
            config.delivery.clone(),
        );
        let channels = ChannelManager::new(
            transport,
            Arc::clone(&store),
            Arc::clone(&delivery),
            Arc::clone(&typing),
            events_tx.clone(),
            mode_rx.clone(),
            config.channel.clone(),
            profile.user_id,
        );

        let executor: Arc<dyn ActionExecutor> = Arc::new(CoreActionExecutor {
            delivery: Arc::clone(&delivery),
            store: Arc::clone(&store),
            profile: profile.clone(),
        });
        let queue = OfflineActionQueue::new(
            offline_store,
            executor,
            events_tx.clone(),
            config.queue.clone(),
            mode_rx.clone(),
        );

        let signals = EnvironmentSignals::new();
        let controller = AdaptiveConnectionController::new(
            config.adaptive.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&typing),
            events_tx.clone(),
            mode_tx,
        );
        let adaptive_task = controller.spawn(signals.receivers());

        // Typing broadcasts flow to the channel layer over a pump so the
        // components stay acyclic; presence is best-effort.
        let pump_channels = Arc::clone(&channels);
        let typing_pump = tokio::spawn(async move {
            while let Some(broadcast) = typing_rx.recv().await {
                if let Err(err) = pump_channels
                    .publish(broadcast.conversation_id, broadcast.event)
                    .await
                {
                    debug!("typing broadcast dropped: {err}");
                }
            }
        });

        let online_watcher = queue.spawn_online_watcher();

        let heartbeat_channels = Arc::clone(&channels);
        scheduler
            .register(
                HEARTBEAT_JOB,
                timings(ConnectionMode::Full).heartbeat,
                job(move || {
                    let channels = Arc::clone(&heartbeat_channels);
                    async move {
                        channels.publish_heartbeat_all().await;
                    }
                }),
            )
            .await;
        let sweep_typing = Arc::clone(&typing);
        scheduler
            .register(
                TYPING_SWEEP_JOB,
                Duration::from_millis(config.typing.sweep_interval_ms),
                job(move || {
                    let typing = Arc::clone(&sweep_typing);
                    async move {
                        typing.sweep();
                    }
                }),
            )
            .await;
        let drain_queue = Arc::clone(&queue);
        scheduler
            .register(
                QUEUE_DRAIN_JOB,
                config.queue.drain_interval(),
                job(move || {
                    let queue = Arc::clone(&drain_queue);
                    async move {
                        queue.execute_pending().await;
                    }
                }),
            )
            .await;

        Arc::new(Self {
            config,
            profile,
            store,
            delivery,
            typing,
            queue,
            channels,
            scheduler,
            signals,
            mode_rx,
            events_tx,
            tasks: vec![adaptive_task, typing_pump, online_watcher],
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.mode_rx.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessagingEvent> {
        self.events_tx.subscribe()
    }

    pub async fn subscribe(&self, conversation_id: ConversationId) -> ConversationSubscription {
        self.channels.subscribe(conversation_id).await
    }

    /// Returns the optimistic message immediately. While offline the send
    /// is persisted to the action queue instead of submitted live.
    pub async fn send_message(&self, request: SendRequest) -> Result<Message, CoreError> {
        if self.mode() == ConnectionMode::Offline {
            let (message, draft) = self.delivery.prepare(request);
            let payload =
                serde_json::to_value(&draft).map_err(|err| CoreError::Submission {
                    reason: err.to_string(),
                })?;
            self.queue
                .enqueue(
                    ActionKind::SendMessage,
                    payload,
                    default_priority(ActionKind::SendMessage),
                )
                .await?;
            return Ok(message);
        }

        Ok(self.delivery.send(request))
    }

    /// Re-enters the live send path for a failed message.
    pub fn retry_message(&self, pending_id: PendingId) -> Option<Message> {
        self.delivery.retry(pending_id)
    }

    pub fn set_typing(&self, conversation_id: ConversationId, is_typing: bool) {
        if is_typing {
            self.typing.start_typing(conversation_id);
        } else {
            self.typing.stop_typing(conversation_id);
        }
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), CoreError> {
        self.channels.mark_read(conversation_id, message_id).await
    }

    /// Fetches recent history from the remote store, oldest first.
    pub async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<shared::protocol::MessageRecord>, CoreError> {
        self.store
            .select_messages(conversation_id, limit)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })
    }

    pub async fn update_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), CoreError> {
        if self.mode() == ConnectionMode::Offline {
            let payload = UpdateMessagePayload {
                message_id,
                content: content.to_string(),
            };
            return self
                .enqueue_payload(ActionKind::UpdateMessage, serde_json::to_value(&payload))
                .await;
        }
        self.store
            .update_message(message_id, content)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), CoreError> {
        if self.mode() == ConnectionMode::Offline {
            let payload = DeleteMessagePayload { message_id };
            return self
                .enqueue_payload(ActionKind::DeleteMessage, serde_json::to_value(&payload))
                .await;
        }
        self.store
            .delete_message(message_id)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })
    }

    pub async fn join_conversation(&self, conversation_id: ConversationId) -> Result<(), CoreError> {
        if self.mode() == ConnectionMode::Offline {
            let payload = MembershipPayload { conversation_id };
            return self
                .enqueue_payload(ActionKind::JoinConversation, serde_json::to_value(&payload))
                .await;
        }
        self.store
            .join_conversation(conversation_id, self.profile.user_id)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })
    }

    pub async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), CoreError> {
        if self.mode() == ConnectionMode::Offline {
            let payload = MembershipPayload { conversation_id };
            return self
                .enqueue_payload(ActionKind::LeaveConversation, serde_json::to_value(&payload))
                .await;
        }
        self.store
            .leave_conversation(conversation_id, self.profile.user_id)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })
    }

    async fn enqueue_payload(
        &self,
        kind: ActionKind,
        payload: Result<serde_json::Value, serde_json::Error>,
    ) -> Result<(), CoreError> {
        let payload = payload.map_err(|err| CoreError::Submission {
            reason: err.to_string(),
        })?;
        self.queue
            .enqueue(kind, payload, default_priority(kind))
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.channels.shutdown_all().await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct CoreActionExecutor {
    delivery: Arc<DeliveryTracker>,
    store: Arc<dyn MessageStore>,
    profile: LocalProfile,
}

#[async_trait]
impl ActionExecutor for CoreActionExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<()> {
        match action.kind {
            ActionKind::SendMessage => {
                let draft: NewMessage = serde_json::from_value(action.payload.clone())
                    .context("malformed send-message payload")?;
                self.delivery.submit_draft(draft).await
            }
            ActionKind::UpdateMessage => {
                let payload: UpdateMessagePayload = serde_json::from_value(action.payload.clone())
                    .context("malformed update-message payload")?;
                self.store
                    .update_message(payload.message_id, &payload.content)
                    .await
            }
            ActionKind::DeleteMessage => {
                let payload: DeleteMessagePayload = serde_json::from_value(action.payload.clone())
                    .context("malformed delete-message payload")?;
                self.store.delete_message(payload.message_id).await
            }
            ActionKind::JoinConversation => {
                let payload: MembershipPayload = serde_json::from_value(action.payload.clone())
                    .context("malformed join-conversation payload")?;
                self.store
                    .join_conversation(payload.conversation_id, self.profile.user_id)
                    .await
            }
            ActionKind::LeaveConversation => {
                let payload: MembershipPayload = serde_json::from_value(action.payload.clone())
                    .context("malformed leave-conversation payload")?;
                self.store
                    .leave_conversation(payload.conversation_id, self.profile.user_id)
                    .await
            }
        }
    }

    async fn abandon(&self, action: &QueuedAction) {
        if action.kind == ActionKind::SendMessage {
            if let Ok(draft) = serde_json::from_value::<NewMessage>(action.payload.clone()) {
                self.delivery
                    .fail(draft.pending_id, ErrorClass::Policy, "retries exhausted");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
