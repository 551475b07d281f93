use std::{fs, time::Duration};

use serde::Deserialize;

/// Runtime tuning knobs, defaults-first. An optional `messaging.toml` in
/// the working directory overrides the defaults, and a small set of
/// environment variables overrides both (the deployment escape hatch).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub database_url: String,
    pub channel: ChannelSettings,
    pub delivery: DeliverySettings,
    pub typing: TypingSettings,
    pub queue: QueueSettings,
    pub adaptive: AdaptiveSettings,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/offline-queue.db".into(),
            channel: ChannelSettings::default(),
            delivery: DeliverySettings::default(),
            typing: TypingSettings::default(),
            queue: QueueSettings::default(),
            adaptive: AdaptiveSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub subscribe_timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            subscribe_timeout_ms: 10_000,
        }
    }
}

impl ChannelSettings {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub submit_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 10_000,
        }
    }
}

impl DeliverySettings {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TypingSettings {
    pub debounce_ms: u64,
    pub auto_stop_ms: u64,
    pub hard_cap_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            auto_stop_ms: 10_000,
            hard_cap_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub drain_interval_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_retries: 3,
            retry_backoff_ms: 5_000,
            drain_interval_ms: 30_000,
            settle_delay_ms: 2_000,
        }
    }
}

impl QueueSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub low_battery_threshold: f32,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            low_battery_threshold: 0.20,
        }
    }
}

pub fn load_config() -> MessagingConfig {
    let mut config = MessagingConfig::default();

    if let Ok(raw) = fs::read_to_string("messaging.toml") {
        if let Ok(file_cfg) = toml::from_str::<MessagingConfig>(&raw) {
            config = file_cfg;
        }
    }

    if let Ok(v) = std::env::var("MESSAGING_DATABASE_URL") {
        config.database_url = v;
    }
    if let Ok(v) = std::env::var("MESSAGING_QUEUE_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            config.queue.capacity = parsed;
        }
    }
    if let Ok(v) = std::env::var("MESSAGING_LOW_BATTERY_THRESHOLD") {
        if let Ok(parsed) = v.parse::<f32>() {
            config.adaptive.low_battery_threshold = parsed;
        }
    }

    config
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
