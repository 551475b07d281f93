use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ContentType, ConversationId, MessageId, MessageStatus, PendingId, UserId,
};

/// Canonical message record as acknowledged by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<MessageId>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// Draft handed to the remote store; carries the client-side pending id so
/// the acknowledgment can be correlated back to the optimistic message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub pending_id: PendingId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<MessageId>,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub user_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub reader_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    MessageCreated {
        message: MessageRecord,
    },
    StatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },
    Typing {
        typing: TypingPayload,
    },
    ReadReceipt {
        receipt: ReadReceiptPayload,
    },
    HeartbeatAck {
        sent_at: DateTime<Utc>,
    },
}

/// Coarse event class used as the batching key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    Message,
    Status,
    Typing,
    Receipt,
    Heartbeat,
}

impl InboundEvent {
    pub fn kind(&self) -> InboundKind {
        match self {
            InboundEvent::MessageCreated { .. } => InboundKind::Message,
            InboundEvent::StatusChanged { .. } => InboundKind::Status,
            InboundEvent::Typing { .. } => InboundKind::Typing,
            InboundEvent::ReadReceipt { .. } => InboundKind::Receipt,
            InboundEvent::HeartbeatAck { .. } => InboundKind::Heartbeat,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    Typing { typing: TypingPayload },
    ReadReceipt { receipt: ReadReceiptPayload },
    Heartbeat { sent_at: DateTime<Utc> },
}

/// Subscription status callback set delivered by the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}
