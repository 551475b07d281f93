use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{ChannelConnection, ChannelState, ConnectionMode, ConversationId, MessageId, UserId},
    error::CoreError,
    protocol::{ChannelStatus, InboundEvent, InboundKind, OutboundEvent, ReadReceiptPayload},
};

use crate::{
    adaptive::timings,
    config::ChannelSettings,
    delivery::DeliveryTracker,
    events::MessagingEvent,
    store::MessageStore,
    transport::{ChannelHandle, RealtimeTransport},
    typing::TypingIndicatorManager,
};

pub fn channel_name(conversation_id: ConversationId) -> String {
    format!("conversation:{}", conversation_id.0)
}

/// Exponential backoff for reconnect attempt `attempt` (1-indexed),
/// capped at `cap_ms`.
pub fn reconnect_delay(base_ms: u64, attempt: u32, cap_ms: u64) -> Duration {
    let shifted = base_ms.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(shifted.min(cap_ms))
}

/// Events delivered to one conversation's subscribers. Inbound traffic is
/// batched per event kind; arrival order is preserved within a batch.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Batch {
        kind: InboundKind,
        events: Vec<InboundEvent>,
    },
    StateChanged {
        state: ChannelState,
    },
    TerminalError {
        reason: String,
    },
}

pub struct ConversationSubscription {
    pub conversation_id: ConversationId,
    pub events: broadcast::Receiver<ConversationEvent>,
    manager: Arc<ChannelManager>,
}

impl ConversationSubscription {
    /// Cancellation primitive: no further events are delivered, and the
    /// underlying channel is torn down once the last subscriber leaves.
    /// In-flight sends are not cancelled.
    pub async fn unsubscribe(self) {
        self.manager.unsubscribe(self.conversation_id).await;
    }
}

struct ChannelEntry {
    refcount: usize,
    subscriber_tx: broadcast::Sender<ConversationEvent>,
    task: JoinHandle<()>,
    stats: Arc<StdMutex<ChannelConnection>>,
    publisher: Arc<Mutex<Option<Arc<dyn ChannelHandle>>>>,
    // Dropping the sender is the shutdown signal for the runner task.
    _shutdown_tx: mpsc::Sender<()>,
}

/// Owns the 1:1 conversation-to-subscription map: reference counting,
/// reconnection, inbound routing, batching, and outbound publishing.
pub struct ChannelManager {
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<dyn MessageStore>,
    delivery: Arc<DeliveryTracker>,
    typing: Arc<TypingIndicatorManager>,
    events: broadcast::Sender<MessagingEvent>,
    mode: watch::Receiver<ConnectionMode>,
    settings: ChannelSettings,
    local_user: UserId,
    channels: Mutex<HashMap<ConversationId, ChannelEntry>>,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn MessageStore>,
        delivery: Arc<DeliveryTracker>,
        typing: Arc<TypingIndicatorManager>,
        events: broadcast::Sender<MessagingEvent>,
        mode: watch::Receiver<ConnectionMode>,
        settings: ChannelSettings,
        local_user: UserId,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            delivery,
            typing,
            events,
            mode,
            settings,
            local_user,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent: the first subscriber creates the underlying channel,
    /// later subscribers share it via a reference count.
    pub async fn subscribe(self: &Arc<Self>, conversation_id: ConversationId) -> ConversationSubscription {
        let mut channels = self.channels.lock().await;
        if let Some(entry) = channels.get_mut(&conversation_id) {
            entry.refcount += 1;
            let receiver = entry.subscriber_tx.subscribe();
            // A runner that spent its reconnect budget parks until the next
            // subscribe call, which restarts it with a fresh budget on the
            // same broadcast channel so earlier subscribers resume too.
            if entry.task.is_finished() {
                entry.stats.lock().expect("stats poisoned").reconnect_attempts = 0;
                let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
                let runner = self.runner(
                    conversation_id,
                    entry.subscriber_tx.clone(),
                    Arc::clone(&entry.stats),
                    Arc::clone(&entry.publisher),
                    shutdown_rx,
                );
                entry.task = tokio::spawn(runner.run());
                entry._shutdown_tx = shutdown_tx;
                info!(conversation_id = conversation_id.0, "channel restarted");
            }
            return ConversationSubscription {
                conversation_id,
                events: receiver,
                manager: Arc::clone(self),
            };
        }

        let subscriber_tx = broadcast::channel(256).0;
        let stats = Arc::new(StdMutex::new(ChannelConnection::default()));
        let publisher: Arc<Mutex<Option<Arc<dyn ChannelHandle>>>> = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let runner = self.runner(
            conversation_id,
            subscriber_tx.clone(),
            Arc::clone(&stats),
            Arc::clone(&publisher),
            shutdown_rx,
        );
        // The receiver must exist before the runner can emit its first
        // state transition.
        let receiver = subscriber_tx.subscribe();
        let task = tokio::spawn(runner.run());
        channels.insert(
            conversation_id,
            ChannelEntry {
                refcount: 1,
                subscriber_tx,
                task,
                stats,
                publisher,
                _shutdown_tx: shutdown_tx,
            },
        );
        info!(conversation_id = conversation_id.0, "channel opened");

        ConversationSubscription {
            conversation_id,
            events: receiver,
            manager: Arc::clone(self),
        }
    }

    fn runner(
        &self,
        conversation_id: ConversationId,
        subscriber_tx: broadcast::Sender<ConversationEvent>,
        stats: Arc<StdMutex<ChannelConnection>>,
        publisher: Arc<Mutex<Option<Arc<dyn ChannelHandle>>>>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> ChannelRunner {
        ChannelRunner {
            conversation_id,
            name: channel_name(conversation_id),
            transport: Arc::clone(&self.transport),
            delivery: Arc::clone(&self.delivery),
            typing: Arc::clone(&self.typing),
            events: self.events.clone(),
            subscriber_tx,
            stats,
            publisher,
            mode: self.mode.clone(),
            settings: self.settings.clone(),
            shutdown_rx,
        }
    }

    pub async fn unsubscribe(&self, conversation_id: ConversationId) {
        let mut channels = self.channels.lock().await;
        let Some(entry) = channels.get_mut(&conversation_id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            // Dropping the entry closes the shutdown channel; the runner
            // tears the subscription down on its next scheduling point.
            channels.remove(&conversation_id);
            info!(conversation_id = conversation_id.0, "channel closed");
        }
    }

    /// Publishes one outbound event on a conversation's live channel.
    pub async fn publish(
        &self,
        conversation_id: ConversationId,
        event: OutboundEvent,
    ) -> Result<(), CoreError> {
        let publisher = {
            let channels = self.channels.lock().await;
            channels
                .get(&conversation_id)
                .map(|entry| Arc::clone(&entry.publisher))
        }
        .ok_or(CoreError::NotSubscribed { conversation_id })?;

        let handle = publisher
            .lock()
            .await
            .clone()
            .ok_or(CoreError::ChannelClosed { conversation_id })?;
        handle
            .publish(event)
            .await
            .map_err(|err| CoreError::Channel {
                conversation_id,
                reason: err.to_string(),
            })
    }

    /// Best-effort heartbeat on every live channel; a no-op while offline.
    pub async fn publish_heartbeat_all(&self) {
        if *self.mode.borrow() == ConnectionMode::Offline {
            return;
        }
        let publishers: Vec<_> = {
            let channels = self.channels.lock().await;
            channels
                .values()
                .map(|entry| Arc::clone(&entry.publisher))
                .collect()
        };
        for publisher in publishers {
            let handle = publisher.lock().await.clone();
            if let Some(handle) = handle {
                let _ = handle
                    .publish(OutboundEvent::Heartbeat { sent_at: Utc::now() })
                    .await;
            }
        }
    }

    /// Updates remote read state and broadcasts a receipt to the other
    /// subscribers of the conversation's channel.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), CoreError> {
        self.store
            .mark_read(message_id, self.local_user)
            .await
            .map_err(|err| CoreError::Submission {
                reason: err.to_string(),
            })?;

        let receipt = ReadReceiptPayload {
            conversation_id,
            message_id,
            reader_id: self.local_user,
        };
        if let Err(err) = self
            .publish(conversation_id, OutboundEvent::ReadReceipt { receipt })
            .await
        {
            debug!("read receipt broadcast skipped: {err}");
        }
        Ok(())
    }

    pub async fn snapshot(&self, conversation_id: ConversationId) -> Option<ChannelConnection> {
        let channels = self.channels.lock().await;
        channels
            .get(&conversation_id)
            .map(|entry| entry.stats.lock().expect("stats poisoned").clone())
    }

    pub async fn shutdown_all(&self) {
        let mut channels = self.channels.lock().await;
        for (_, entry) in channels.drain() {
            entry.task.abort();
        }
    }
}

/// Buffers inbound events per kind within the batch window, preserving
/// arrival order within each kind.
#[derive(Default)]
struct Batcher {
    order: Vec<InboundKind>,
    buckets: HashMap<InboundKind, Vec<InboundEvent>>,
}

impl Batcher {
    fn push(&mut self, event: InboundEvent) {
        let kind = event.kind();
        if !self.buckets.contains_key(&kind) {
            self.order.push(kind);
        }
        self.buckets.entry(kind).or_default().push(event);
    }

    fn drain(&mut self) -> Vec<(InboundKind, Vec<InboundEvent>)> {
        let mut batches = Vec::with_capacity(self.order.len());
        for kind in self.order.drain(..) {
            if let Some(events) = self.buckets.remove(&kind) {
                batches.push((kind, events));
            }
        }
        batches
    }
}

struct ChannelRunner {
    conversation_id: ConversationId,
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    delivery: Arc<DeliveryTracker>,
    typing: Arc<TypingIndicatorManager>,
    events: broadcast::Sender<MessagingEvent>,
    subscriber_tx: broadcast::Sender<ConversationEvent>,
    stats: Arc<StdMutex<ChannelConnection>>,
    publisher: Arc<Mutex<Option<Arc<dyn ChannelHandle>>>>,
    mode: watch::Receiver<ConnectionMode>,
    settings: ChannelSettings,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ChannelRunner {
    async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            self.set_state(ChannelState::Subscribing);
            let subscribed = tokio::time::timeout(
                self.settings.subscribe_timeout(),
                self.transport.subscribe(&self.name),
            )
            .await;

            let handle = match subscribed {
                Ok(Ok(handle)) => handle,
                Ok(Err(err)) => {
                    self.set_state(ChannelState::Disconnected);
                    if self
                        .backoff_or_give_up(&mut attempts, &format!("subscribe failed: {err}"))
                        .await
                    {
                        continue;
                    }
                    return;
                }
                Err(_) => {
                    self.set_state(ChannelState::Disconnected);
                    if self
                        .backoff_or_give_up(&mut attempts, "subscribe timed out")
                        .await
                    {
                        continue;
                    }
                    return;
                }
            };

            // Event and status receivers must exist before the connected
            // state is announced, or early traffic would be lost.
            let events_rx = handle.events();
            let status_rx = handle.status();
            *self.publisher.lock().await = Some(Arc::clone(&handle));
            self.set_state(ChannelState::Connected);

            let drop_reason = self.pump(events_rx, status_rx, &mut attempts).await;

            *self.publisher.lock().await = None;
            handle.close().await;
            self.set_state(ChannelState::Disconnected);

            match drop_reason {
                None => return,
                Some(reason) => {
                    if !self.backoff_or_give_up(&mut attempts, &reason).await {
                        return;
                    }
                }
            }
        }
    }

    /// Runs the connected select loop. Returns the drop reason, or `None`
    /// on an orderly shutdown.
    async fn pump(
        &mut self,
        mut events_rx: broadcast::Receiver<InboundEvent>,
        mut status_rx: broadcast::Receiver<ChannelStatus>,
        attempts: &mut u32,
    ) -> Option<String> {
        let mut batcher = Batcher::default();
        let mut next_flush = tokio::time::Instant::now() + self.batch_window();

        let reason = loop {
            tokio::select! {
                inbound = events_rx.recv() => match inbound {
                    Ok(event) => {
                        self.route(&event, attempts);
                        batcher.push(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation_id = self.conversation_id.0,
                            skipped, "inbound events lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break Some("event stream closed".to_string());
                    }
                },
                status = status_rx.recv() => match status {
                    Ok(ChannelStatus::Subscribed) => {}
                    Ok(ChannelStatus::ChannelError) => break Some("channel error".to_string()),
                    Ok(ChannelStatus::TimedOut) => break Some("channel timed out".to_string()),
                    Ok(ChannelStatus::Closed) => break Some("channel closed".to_string()),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        break Some("status stream closed".to_string());
                    }
                },
                _ = tokio::time::sleep_until(next_flush) => {
                    self.flush(&mut batcher);
                    next_flush = tokio::time::Instant::now() + self.batch_window();
                }
                _ = self.shutdown_rx.recv() => break None,
            }
        };

        self.flush(&mut batcher);
        reason
    }

    fn batch_window(&self) -> Duration {
        timings(*self.mode.borrow()).batch_window
    }

    /// Applies one inbound event to the delivery/typing state machines
    /// before it is batched out to subscribers.
    fn route(&self, event: &InboundEvent, attempts: &mut u32) {
        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            if matches!(event, InboundEvent::MessageCreated { .. }) {
                stats.message_count += 1;
            }
            stats.last_message_at = Some(Utc::now());
            // Traffic on the channel is the recovery signal: a reconnected
            // channel that carries events again earns a fresh retry budget.
            if *attempts > 0 {
                *attempts = 0;
                stats.reconnect_attempts = 0;
            }
        }

        match event {
            InboundEvent::MessageCreated { .. } | InboundEvent::HeartbeatAck { .. } => {}
            InboundEvent::StatusChanged { message_id, status } => {
                self.delivery.apply_status(*message_id, *status);
            }
            InboundEvent::Typing { typing } => {
                self.typing.apply_remote(typing);
            }
            InboundEvent::ReadReceipt { receipt } => {
                self.delivery.apply_read_receipt(receipt);
                let _ = self.events.send(MessagingEvent::ReadReceipt {
                    receipt: receipt.clone(),
                });
            }
        }
    }

    fn flush(&self, batcher: &mut Batcher) {
        for (kind, events) in batcher.drain() {
            let _ = self
                .subscriber_tx
                .send(ConversationEvent::Batch { kind, events });
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.stats.lock().expect("stats poisoned").state = state;
        let _ = self
            .subscriber_tx
            .send(ConversationEvent::StateChanged { state });
        let _ = self.events.send(MessagingEvent::ChannelStateChanged {
            conversation_id: self.conversation_id,
            state,
        });
    }

    /// Either sleeps out the backoff for the next reconnect attempt and
    /// returns true, or reports the terminal error and returns false once
    /// the attempt budget is spent. The channel is recreated from scratch
    /// on every retry; there is no partial-state resume.
    async fn backoff_or_give_up(&mut self, attempts: &mut u32, reason: &str) -> bool {
        if *attempts >= self.settings.max_reconnect_attempts {
            warn!(
                conversation_id = self.conversation_id.0,
                attempts = *attempts,
                "channel giving up: {reason}"
            );
            self.stats.lock().expect("stats poisoned").state = ChannelState::Error;
            let _ = self.subscriber_tx.send(ConversationEvent::StateChanged {
                state: ChannelState::Error,
            });
            let _ = self.subscriber_tx.send(ConversationEvent::TerminalError {
                reason: reason.to_string(),
            });
            let _ = self.events.send(MessagingEvent::ChannelTerminalError {
                conversation_id: self.conversation_id,
                reason: reason.to_string(),
            });
            return false;
        }

        *attempts += 1;
        self.stats.lock().expect("stats poisoned").reconnect_attempts = *attempts;
        let delay = reconnect_delay(
            self.settings.reconnect_base_delay_ms,
            *attempts,
            self.settings.reconnect_max_delay_ms,
        );
        debug!(
            conversation_id = self.conversation_id.0,
            attempt = *attempts,
            delay_ms = delay.as_millis() as u64,
            "channel reconnecting: {reason}"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.recv() => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
