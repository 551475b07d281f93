use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use shared::{
    domain::{
        ContentType, ConversationId, Message, MessageId, MessageRef, MessageStatus, PendingId,
        UserId,
    },
    error::ErrorClass,
    protocol::{MessageRecord, NewMessage, ReadReceiptPayload},
};

use crate::{config::DeliverySettings, events::MessagingEvent, store::MessageStore};

#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub content_type: ContentType,
    pub content_url: Option<String>,
    pub replied_to: Option<MessageId>,
    pub is_anonymous: bool,
}

impl SendRequest {
    pub fn text(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            content_type: ContentType::Text,
            content_url: None,
            replied_to: None,
            is_anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationDeliveryStats {
    pub acked: u64,
    pub cumulative_latency: Duration,
}

#[derive(Default)]
struct TrackerState {
    messages: HashMap<PendingId, Message>,
    // The one pending-to-durable correlation map.
    durable_index: HashMap<MessageId, PendingId>,
    inflight: HashMap<PendingId, Instant>,
    stats: HashMap<ConversationId, ConversationDeliveryStats>,
}

/// Owns the send life cycle: optimistic construction, remote submission,
/// and forward-only status transitions driven by acks and channel events.
pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
    events: broadcast::Sender<MessagingEvent>,
    profile: LocalProfile,
    settings: DeliverySettings,
    state: Mutex<TrackerState>,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        events: broadcast::Sender<MessagingEvent>,
        profile: LocalProfile,
        settings: DeliverySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            profile,
            settings,
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Allocates the pending identity, registers the optimistic message,
    /// and emits it to the UI before any network work happens.
    pub fn prepare(&self, request: SendRequest) -> (Message, NewMessage) {
        let pending_id = PendingId::generate();
        let message = Message {
            id: MessageRef::Pending(pending_id),
            conversation_id: request.conversation_id,
            sender_id: self.profile.user_id,
            sender_name: self.profile.display_name.clone(),
            content: request.content.clone(),
            content_type: request.content_type,
            content_url: request.content_url.clone(),
            status: MessageStatus::Sending,
            created_at: Utc::now(),
            replied_to: request.replied_to,
            is_anonymous: request.is_anonymous,
        };
        let draft = NewMessage {
            pending_id,
            conversation_id: request.conversation_id,
            sender_id: self.profile.user_id,
            sender_name: self.profile.display_name.clone(),
            content: request.content,
            content_type: request.content_type,
            content_url: request.content_url,
            replied_to: request.replied_to,
            is_anonymous: request.is_anonymous,
        };

        self.state
            .lock()
            .expect("delivery state poisoned")
            .messages
            .insert(pending_id, message.clone());
        let _ = self.events.send(MessagingEvent::MessageAdded {
            message: message.clone(),
        });

        (message, draft)
    }

    /// Live send path: returns the optimistic message immediately and
    /// completes the round trip on a background task.
    pub fn send(self: &Arc<Self>, request: SendRequest) -> Message {
        let (message, draft) = self.prepare(request);
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = tracker.submit_draft(draft.clone()).await {
                debug!(
                    conversation_id = draft.conversation_id.0,
                    "send failed: {err}"
                );
            }
        });
        message
    }

    /// Submits a prepared draft and settles the correlated message. Used
    /// inline by the live send task and by offline-queue replay.
    pub async fn submit_draft(&self, draft: NewMessage) -> anyhow::Result<()> {
        {
            let state = self.state.lock().expect("delivery state poisoned");
            if let Some(message) = state.messages.get(&draft.pending_id) {
                if message.status != MessageStatus::Sending {
                    // Already settled by an earlier attempt.
                    return Ok(());
                }
            }
        }

        self.state
            .lock()
            .expect("delivery state poisoned")
            .inflight
            .insert(draft.pending_id, Instant::now());

        let submitted =
            tokio::time::timeout(self.settings.submit_timeout(), self.store.insert_message(&draft))
                .await;

        match submitted {
            Ok(Ok(record)) => {
                self.complete_submission(draft.pending_id, &record);
                Ok(())
            }
            Ok(Err(err)) => {
                self.fail(draft.pending_id, ErrorClass::Submission, &err.to_string());
                Err(err)
            }
            Err(_) => {
                let reason = "submission timed out";
                self.fail(draft.pending_id, ErrorClass::Transport, reason);
                Err(anyhow::anyhow!(reason))
            }
        }
    }

    fn complete_submission(&self, pending_id: PendingId, record: &MessageRecord) {
        let mut state = self.state.lock().expect("delivery state poisoned");
        let latency = state
            .inflight
            .remove(&pending_id)
            .map(|started| started.elapsed())
            .unwrap_or_default();

        let Some(message) = state.messages.get_mut(&pending_id) else {
            return;
        };
        if !message.status.can_transition(MessageStatus::Sent) {
            return;
        }
        message.id = MessageRef::Durable(record.message_id);
        message.status = MessageStatus::Sent;
        let conversation_id = message.conversation_id;

        state.durable_index.insert(record.message_id, pending_id);
        let stats = state.stats.entry(conversation_id).or_default();
        stats.acked += 1;
        stats.cumulative_latency += latency;
        drop(state);

        info!(
            conversation_id = conversation_id.0,
            message_id = record.message_id.0,
            latency_ms = latency.as_millis() as u64,
            "message acknowledged"
        );
        let _ = self.events.send(MessagingEvent::MessageStatusChanged {
            conversation_id,
            pending_id: Some(pending_id),
            message_id: Some(record.message_id),
            status: MessageStatus::Sent,
        });
    }

    /// Marks a tracked message failed, if the state machine allows it.
    pub fn fail(&self, pending_id: PendingId, class: ErrorClass, reason: &str) {
        let conversation_id = {
            let mut state = self.state.lock().expect("delivery state poisoned");
            state.inflight.remove(&pending_id);
            let Some(message) = state.messages.get_mut(&pending_id) else {
                return;
            };
            if !message.status.can_transition(MessageStatus::Failed) {
                return;
            }
            message.status = MessageStatus::Failed;
            message.conversation_id
        };

        warn!(
            conversation_id = conversation_id.0,
            class = ?class,
            "message failed: {reason}"
        );
        let _ = self.events.send(MessagingEvent::MessageFailed {
            conversation_id,
            pending_id,
            class,
            reason: reason.to_string(),
        });
    }

    /// Applies a delivered/read transition arriving over the channel.
    /// Idempotent and forward-only: a stale `Delivered` after `Read` is a
    /// no-op, and unknown ids are ignored.
    pub fn apply_status(&self, message_id: MessageId, status: MessageStatus) {
        let update = {
            let mut state = self.state.lock().expect("delivery state poisoned");
            let Some(pending_id) = state.durable_index.get(&message_id).copied() else {
                return;
            };
            let Some(message) = state.messages.get_mut(&pending_id) else {
                return;
            };
            if !message.status.can_transition(status) {
                return;
            }
            message.status = status;
            Some((message.conversation_id, pending_id))
        };

        if let Some((conversation_id, pending_id)) = update {
            let _ = self.events.send(MessagingEvent::MessageStatusChanged {
                conversation_id,
                pending_id: Some(pending_id),
                message_id: Some(message_id),
                status,
            });
        }
    }

    /// A read receipt from another participant implies delivery.
    pub fn apply_read_receipt(&self, receipt: &ReadReceiptPayload) {
        self.apply_status(receipt.message_id, MessageStatus::Read);
    }

    /// Re-enters the live send path for a failed message, reusing its
    /// pending identity so the UI keeps a single row.
    pub fn retry(self: &Arc<Self>, pending_id: PendingId) -> Option<Message> {
        let draft = {
            let mut state = self.state.lock().expect("delivery state poisoned");
            let message = state.messages.get_mut(&pending_id)?;
            if message.status != MessageStatus::Failed {
                return None;
            }
            message.status = MessageStatus::Sending;
            message.id = MessageRef::Pending(pending_id);
            NewMessage {
                pending_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                sender_name: message.sender_name.clone(),
                content: message.content.clone(),
                content_type: message.content_type,
                content_url: message.content_url.clone(),
                replied_to: message.replied_to,
                is_anonymous: message.is_anonymous,
            }
        };

        let _ = self.events.send(MessagingEvent::MessageStatusChanged {
            conversation_id: draft.conversation_id,
            pending_id: Some(pending_id),
            message_id: None,
            status: MessageStatus::Sending,
        });

        let tracker = Arc::clone(self);
        let spawned = draft.clone();
        tokio::spawn(async move {
            let _ = tracker.submit_draft(spawned).await;
        });

        self.message(pending_id)
    }

    pub fn message(&self, pending_id: PendingId) -> Option<Message> {
        self.state
            .lock()
            .expect("delivery state poisoned")
            .messages
            .get(&pending_id)
            .cloned()
    }

    pub fn stats(&self, conversation_id: ConversationId) -> ConversationDeliveryStats {
        self.state
            .lock()
            .expect("delivery state poisoned")
            .stats
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
