use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

macro_rules! client_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

client_id_newtype!(PendingId);
client_id_newtype!(ActionId);

/// Two-phase message identity: a message is addressed by its client-side
/// pending id until the remote store acknowledges it with a durable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageRef {
    Pending(PendingId),
    Durable(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// A message only moves forward through the delivery pipeline;
    /// `Failed` is reachable from `Sending` or `Sent` only.
    pub fn can_transition(self, next: MessageStatus) -> bool {
        match next {
            MessageStatus::Failed => {
                matches!(self, MessageStatus::Sending | MessageStatus::Sent)
            }
            _ => self != MessageStatus::Failed && next.rank() > self.rank(),
        }
    }

    /// True once the message has left `Sending`.
    pub fn is_terminal(self) -> bool {
        self != MessageStatus::Sending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageRef,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<MessageId>,
    pub is_anonymous: bool,
}

/// Presence of one user typing in one conversation. Never persisted.
#[derive(Debug, Clone)]
pub struct TypingState {
    pub user_id: UserId,
    pub user_name: String,
    pub conversation_id: ConversationId,
    pub is_typing: bool,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    UpdateMessage,
    DeleteMessage,
    JoinConversation,
    LeaveConversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Subscribing,
    Connected,
    Disconnected,
    Error,
}

/// Per-conversation connection bookkeeping, surfaced as a snapshot.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    pub state: ChannelState,
    pub reconnect_attempts: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub cumulative_latency: Duration,
}

impl Default for ChannelConnection {
    fn default() -> Self {
        Self {
            state: ChannelState::Subscribing,
            reconnect_attempts: 0,
            last_message_at: None,
            message_count: 0,
            cumulative_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Full,
    Efficient,
    Minimal,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppVisibility {
    Foreground,
    Background,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    High,
    Medium,
    Low,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge fraction in `0.0..=1.0`.
    pub level: f32,
    pub charging: bool,
}
