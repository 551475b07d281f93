use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MessageRecord, NewMessage},
};

/// Request/response seam to the remote message store. Implementations are
/// externally owned; the core only needs the canonical record back.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, draft: &NewMessage) -> Result<MessageRecord>;
    async fn update_message(&self, message_id: MessageId, content: &str) -> Result<()>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn mark_read(&self, message_id: MessageId, reader_id: UserId) -> Result<()>;
    async fn select_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>>;
    async fn join_conversation(&self, conversation_id: ConversationId, user_id: UserId)
        -> Result<()>;
    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()>;
}

pub struct MissingMessageStore;

#[async_trait]
impl MessageStore for MissingMessageStore {
    async fn insert_message(&self, draft: &NewMessage) -> Result<MessageRecord> {
        Err(anyhow!(
            "message store is unavailable for conversation {}",
            draft.conversation_id.0
        ))
    }

    async fn update_message(&self, message_id: MessageId, _content: &str) -> Result<()> {
        Err(anyhow!(
            "message store is unavailable for message {}",
            message_id.0
        ))
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        Err(anyhow!(
            "message store is unavailable for message {}",
            message_id.0
        ))
    }

    async fn mark_read(&self, message_id: MessageId, _reader_id: UserId) -> Result<()> {
        Err(anyhow!(
            "message store is unavailable for message {}",
            message_id.0
        ))
    }

    async fn select_messages(
        &self,
        conversation_id: ConversationId,
        _limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        Err(anyhow!(
            "message store is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn join_conversation(
        &self,
        conversation_id: ConversationId,
        _user_id: UserId,
    ) -> Result<()> {
        Err(anyhow!(
            "message store is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        _user_id: UserId,
    ) -> Result<()> {
        Err(anyhow!(
            "message store is unavailable for conversation {}",
            conversation_id.0
        ))
    }
}

/// In-process store used by the demo binary and tests. Assigns durable ids
/// from a counter and keeps every accepted record.
pub struct MemoryMessageStore {
    records: Mutex<Vec<MessageRecord>>,
    next_id: AtomicI64,
    fail_inserts: AtomicUsize,
}

impl MemoryMessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_inserts: AtomicUsize::new(0),
        })
    }

    /// Makes the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.fail_inserts.store(count, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_message(&self, draft: &NewMessage) -> Result<MessageRecord> {
        let remaining = self.fail_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("insert rejected"));
        }

        let record = MessageRecord {
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name.clone(),
            content: draft.content.clone(),
            content_type: draft.content_type,
            content_url: draft.content_url.clone(),
            replied_to: draft.replied_to,
            is_anonymous: draft.is_anonymous,
            created_at: Utc::now(),
        };
        self.records.lock().await.push(record.clone());
        Ok(record)
    }

    async fn update_message(&self, message_id: MessageId, content: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.message_id == message_id)
            .ok_or_else(|| anyhow!("unknown message {}", message_id.0))?;
        record.content = content.to_string();
        Ok(())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.message_id != message_id);
        if records.len() == before {
            return Err(anyhow!("unknown message {}", message_id.0));
        }
        Ok(())
    }

    async fn mark_read(&self, _message_id: MessageId, _reader_id: UserId) -> Result<()> {
        Ok(())
    }

    async fn select_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .rev()
            .take(limit as usize)
            .rev()
            .cloned()
            .collect())
    }

    async fn join_conversation(
        &self,
        _conversation_id: ConversationId,
        _user_id: UserId,
    ) -> Result<()> {
        Ok(())
    }

    async fn leave_conversation(
        &self,
        _conversation_id: ConversationId,
        _user_id: UserId,
    ) -> Result<()> {
        Ok(())
    }
}
