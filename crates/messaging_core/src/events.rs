use shared::{
    domain::{
        ActionKind, ChannelState, ConnectionMode, ConversationId, Message, MessageId,
        MessageStatus, PendingId, UserId,
    },
    error::ErrorClass,
    protocol::ReadReceiptPayload,
};

/// Process-wide event stream consumed by the UI layer.
///
/// Cloneable so it can ride a `broadcast` channel; failures carry the
/// classified reason rather than the error value itself.
#[derive(Debug, Clone)]
pub enum MessagingEvent {
    MessageAdded {
        message: Message,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        pending_id: Option<PendingId>,
        message_id: Option<MessageId>,
        status: MessageStatus,
    },
    MessageFailed {
        conversation_id: ConversationId,
        pending_id: PendingId,
        class: ErrorClass,
        reason: String,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ReadReceipt {
        receipt: ReadReceiptPayload,
    },
    ChannelStateChanged {
        conversation_id: ConversationId,
        state: ChannelState,
    },
    ChannelTerminalError {
        conversation_id: ConversationId,
        reason: String,
    },
    ActionDropped {
        kind: ActionKind,
        attempts: u32,
    },
    ModeChanged {
        mode: ConnectionMode,
    },
}
