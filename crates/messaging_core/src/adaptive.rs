use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::info;

use shared::domain::{AppVisibility, BatteryState, ConnectionMode, NetworkQuality};

use crate::{
    config::AdaptiveSettings, events::MessagingEvent, scheduler::Scheduler,
    typing::TypingIndicatorManager,
};

pub const HEARTBEAT_JOB: &str = "heartbeat";
pub const QUEUE_DRAIN_JOB: &str = "queue_drain";
pub const TYPING_SWEEP_JOB: &str = "typing_sweep";

/// Timer bundle applied uniformly for a connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTimings {
    pub heartbeat: Duration,
    pub batch_window: Duration,
    pub drain_interval: Duration,
}

pub fn timings(mode: ConnectionMode) -> ModeTimings {
    match mode {
        ConnectionMode::Full => ModeTimings {
            heartbeat: Duration::from_secs(30),
            batch_window: Duration::from_millis(100),
            drain_interval: Duration::from_secs(30),
        },
        ConnectionMode::Efficient => ModeTimings {
            heartbeat: Duration::from_secs(120),
            batch_window: Duration::from_secs(2),
            drain_interval: Duration::from_secs(60),
        },
        ConnectionMode::Minimal => ModeTimings {
            heartbeat: Duration::from_secs(300),
            batch_window: Duration::from_secs(5),
            drain_interval: Duration::from_secs(120),
        },
        // Queue-only: heartbeats are suppressed at the publish site, the
        // drain job keeps ticking so recovery is prompt.
        ConnectionMode::Offline => ModeTimings {
            heartbeat: Duration::from_secs(300),
            batch_window: Duration::from_secs(5),
            drain_interval: Duration::from_secs(300),
        },
    }
}

/// Total mapping from environment signals to a connection mode; the
/// highest-priority rule wins.
pub fn derive_mode(
    visibility: AppVisibility,
    network: NetworkQuality,
    battery: Option<BatteryState>,
    low_battery_threshold: f32,
) -> ConnectionMode {
    if visibility == AppVisibility::Terminating {
        return ConnectionMode::Minimal;
    }
    if network == NetworkQuality::Offline {
        return ConnectionMode::Offline;
    }
    if visibility == AppVisibility::Background {
        return ConnectionMode::Efficient;
    }
    if let Some(battery) = battery {
        if battery.level < low_battery_threshold && !battery.charging {
            return ConnectionMode::Minimal;
        }
    }
    match network {
        NetworkQuality::High => ConnectionMode::Full,
        NetworkQuality::Medium => ConnectionMode::Efficient,
        NetworkQuality::Low => ConnectionMode::Minimal,
        NetworkQuality::Offline => ConnectionMode::Offline,
    }
}

/// Hooks the platform layer feeds: visibility, network quality, battery.
/// Absent battery information skips the battery rule entirely.
pub struct EnvironmentSignals {
    visibility: watch::Sender<AppVisibility>,
    network: watch::Sender<NetworkQuality>,
    battery: watch::Sender<Option<BatteryState>>,
}

impl Default for EnvironmentSignals {
    fn default() -> Self {
        Self {
            visibility: watch::channel(AppVisibility::Foreground).0,
            network: watch::channel(NetworkQuality::High).0,
            battery: watch::channel(None).0,
        }
    }
}

impl EnvironmentSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visibility(&self, visibility: AppVisibility) {
        let _ = self.visibility.send(visibility);
    }

    pub fn set_network(&self, quality: NetworkQuality) {
        let _ = self.network.send(quality);
    }

    pub fn set_battery(&self, battery: Option<BatteryState>) {
        let _ = self.battery.send(battery);
    }

    pub fn receivers(&self) -> EnvironmentReceivers {
        EnvironmentReceivers {
            visibility: self.visibility.subscribe(),
            network: self.network.subscribe(),
            battery: self.battery.subscribe(),
        }
    }
}

pub struct EnvironmentReceivers {
    pub visibility: watch::Receiver<AppVisibility>,
    pub network: watch::Receiver<NetworkQuality>,
    pub battery: watch::Receiver<Option<BatteryState>>,
}

/// Watches the environment and retunes every adaptive timer atomically
/// when the derived mode changes. Open channels are never resubscribed on
/// a mode change; only timers move.
pub struct AdaptiveConnectionController {
    settings: AdaptiveSettings,
    scheduler: Arc<Scheduler>,
    typing: Arc<TypingIndicatorManager>,
    events: broadcast::Sender<MessagingEvent>,
    mode_tx: watch::Sender<ConnectionMode>,
}

impl AdaptiveConnectionController {
    pub fn new(
        settings: AdaptiveSettings,
        scheduler: Arc<Scheduler>,
        typing: Arc<TypingIndicatorManager>,
        events: broadcast::Sender<MessagingEvent>,
        mode_tx: watch::Sender<ConnectionMode>,
    ) -> Self {
        Self {
            settings,
            scheduler,
            typing,
            events,
            mode_tx,
        }
    }

    pub fn spawn(self, mut receivers: EnvironmentReceivers) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mode = derive_mode(
                    *receivers.visibility.borrow(),
                    *receivers.network.borrow(),
                    *receivers.battery.borrow(),
                    self.settings.low_battery_threshold,
                );
                self.apply(mode).await;

                let stopped = tokio::select! {
                    changed = receivers.visibility.changed() => changed.is_err(),
                    changed = receivers.network.changed() => changed.is_err(),
                    changed = receivers.battery.changed() => changed.is_err(),
                };
                if stopped {
                    break;
                }
            }
        })
    }

    async fn apply(&self, mode: ConnectionMode) {
        if *self.mode_tx.borrow() == mode {
            return;
        }
        let _ = self.mode_tx.send(mode);

        let timings = timings(mode);
        self.scheduler
            .retune_many(&[
                (HEARTBEAT_JOB, timings.heartbeat),
                (QUEUE_DRAIN_JOB, timings.drain_interval),
            ])
            .await;
        self.typing.set_efficient(mode != ConnectionMode::Full);

        info!(mode = ?mode, "connection mode changed");
        let _ = self.events.send(MessagingEvent::ModeChanged { mode });
    }
}

#[cfg(test)]
#[path = "tests/adaptive_tests.rs"]
mod tests;
