use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use shared::protocol::{ChannelStatus, InboundEvent, OutboundEvent};

/// One live subscription to a conversation's event stream.
///
/// A successful `RealtimeTransport::subscribe` is the subscription ack;
/// `status()` then carries the transport's lifecycle callbacks
/// (`channel_error`, `timed_out`, `closed`).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<InboundEvent>;
    fn status(&self) -> broadcast::Receiver<ChannelStatus>;
    async fn close(&self);
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn ChannelHandle>>;
}

pub struct MissingTransport;

#[async_trait]
impl RealtimeTransport for MissingTransport {
    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn ChannelHandle>> {
        Err(anyhow!(
            "realtime transport is unavailable for channel {channel_name}"
        ))
    }
}

/// Tracing middleware composed around a transport. Explicit decoration,
/// not interception: callers opt in by wrapping.
pub struct InstrumentedTransport {
    inner: Arc<dyn RealtimeTransport>,
}

impl InstrumentedTransport {
    pub fn new(inner: Arc<dyn RealtimeTransport>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl RealtimeTransport for InstrumentedTransport {
    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn ChannelHandle>> {
        let started = Instant::now();
        match self.inner.subscribe(channel_name).await {
            Ok(handle) => {
                debug!(
                    channel = channel_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "transport: subscribed"
                );
                Ok(Arc::new(InstrumentedChannel {
                    channel: channel_name.to_string(),
                    inner: handle,
                }))
            }
            Err(err) => {
                warn!(channel = channel_name, "transport: subscribe failed: {err}");
                Err(err)
            }
        }
    }
}

struct InstrumentedChannel {
    channel: String,
    inner: Arc<dyn ChannelHandle>,
}

#[async_trait]
impl ChannelHandle for InstrumentedChannel {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        let result = self.inner.publish(event).await;
        if let Err(err) = &result {
            warn!(channel = %self.channel, "transport: publish failed: {err}");
        }
        result
    }

    fn events(&self) -> broadcast::Receiver<InboundEvent> {
        self.inner.events()
    }

    fn status(&self) -> broadcast::Receiver<ChannelStatus> {
        self.inner.status()
    }

    async fn close(&self) {
        debug!(channel = %self.channel, "transport: channel closed");
        self.inner.close().await;
    }
}

/// In-process loopback transport used by the demo binary and tests.
///
/// Channels are created on first subscribe and kept so tests can inject
/// inbound events and status transitions after the fact.
pub struct MemoryTransport {
    channels: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    fail_subscribes: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            fail_subscribes: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.fail_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub async fn channel(&self, name: &str) -> Option<Arc<MemoryChannel>> {
        self.channels.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn ChannelHandle>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("subscribe refused for channel {channel_name}"));
        }

        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(channel_name.to_string())
            .or_insert_with(|| Arc::new(MemoryChannel::new(channel_name)))
            .clone();
        Ok(channel)
    }
}

pub struct MemoryChannel {
    name: String,
    events_tx: broadcast::Sender<InboundEvent>,
    status_tx: broadcast::Sender<ChannelStatus>,
    published: Mutex<Vec<OutboundEvent>>,
    fail_publishes: AtomicUsize,
}

impl MemoryChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events_tx: broadcast::channel(256).0,
            status_tx: broadcast::channel(64).0,
            published: Mutex::new(Vec::new()),
            fail_publishes: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Injects an inbound event as if it arrived from the service.
    pub fn emit(&self, event: InboundEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Injects a status callback.
    pub fn emit_status(&self, status: ChannelStatus) {
        let _ = self.status_tx.send(status);
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_publishes.store(count, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<OutboundEvent> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        let remaining = self.fail_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("publish refused on channel {}", self.name));
        }
        self.published.lock().await.push(event);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<InboundEvent> {
        self.events_tx.subscribe()
    }

    fn status(&self) -> broadcast::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    async fn close(&self) {}
}
