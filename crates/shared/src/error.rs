use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ActionKind, ConversationId, MessageStatus};

/// Coarse failure classification used for routing recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Submission,
    Capacity,
    Policy,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("channel failure for conversation {}: {reason}", .conversation_id.0)]
    Channel {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("subscription to conversation {} timed out", .conversation_id.0)]
    SubscribeTimeout { conversation_id: ConversationId },
    #[error("channel for conversation {} closed", .conversation_id.0)]
    ChannelClosed { conversation_id: ConversationId },
    #[error("not subscribed to conversation {}", .conversation_id.0)]
    NotSubscribed { conversation_id: ConversationId },
    #[error("remote store rejected the write: {reason}")]
    Submission { reason: String },
    #[error("offline queue is full")]
    QueueFull,
    #[error("local store rejected the write: {reason}")]
    StorageQuota { reason: String },
    #[error("action {kind:?} dropped after {attempts} attempts")]
    MaxRetriesExceeded { kind: ActionKind, attempts: u32 },
    #[error("gave up on conversation {} after {attempts} reconnect attempts", .conversation_id.0)]
    MaxReconnectsExceeded {
        conversation_id: ConversationId,
        attempts: u32,
    },
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Channel { .. }
            | CoreError::SubscribeTimeout { .. }
            | CoreError::ChannelClosed { .. }
            | CoreError::NotSubscribed { .. } => ErrorClass::Transport,
            CoreError::Submission { .. } | CoreError::InvalidTransition { .. } => {
                ErrorClass::Submission
            }
            CoreError::QueueFull | CoreError::StorageQuota { .. } => ErrorClass::Capacity,
            CoreError::MaxRetriesExceeded { .. } | CoreError::MaxReconnectsExceeded { .. } => {
                ErrorClass::Policy
            }
        }
    }
}
