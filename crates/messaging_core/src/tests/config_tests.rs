use super::*;

#[test]
fn defaults_cover_every_section() {
    let config = MessagingConfig::default();
    assert_eq!(config.channel.max_reconnect_attempts, 5);
    assert_eq!(config.channel.reconnect_base_delay_ms, 1_000);
    assert_eq!(config.channel.reconnect_max_delay_ms, 30_000);
    assert_eq!(config.delivery.submit_timeout_ms, 10_000);
    assert_eq!(config.typing.debounce_ms, 500);
    assert_eq!(config.typing.auto_stop_ms, 10_000);
    assert_eq!(config.typing.hard_cap_ms, 30_000);
    assert_eq!(config.typing.sweep_interval_ms, 5_000);
    assert_eq!(config.queue.capacity, 1_000);
    assert_eq!(config.queue.max_retries, 3);
    assert_eq!(config.queue.drain_interval_ms, 30_000);
    assert_eq!(config.queue.settle_delay_ms, 2_000);
    assert!((config.adaptive.low_battery_threshold - 0.20).abs() < f32::EPSILON);
}

#[test]
fn partial_toml_overrides_merge_over_defaults() {
    let config: MessagingConfig = toml::from_str(
        r#"
        database_url = "sqlite::memory:"

        [queue]
        capacity = 50

        [typing]
        debounce_ms = 250
        "#,
    )
    .expect("parse");

    assert_eq!(config.database_url, "sqlite::memory:");
    assert_eq!(config.queue.capacity, 50);
    assert_eq!(config.queue.max_retries, 3, "untouched keys keep defaults");
    assert_eq!(config.typing.debounce_ms, 250);
    assert_eq!(config.channel.max_reconnect_attempts, 5);
}

#[test]
fn environment_variables_win_over_defaults() {
    std::env::set_var("MESSAGING_QUEUE_CAPACITY", "77");
    std::env::set_var("MESSAGING_DATABASE_URL", "sqlite://./env-override.db");

    let config = load_config();
    assert_eq!(config.queue.capacity, 77);
    assert_eq!(config.database_url, "sqlite://./env-override.db");

    std::env::remove_var("MESSAGING_QUEUE_CAPACITY");
    std::env::remove_var("MESSAGING_DATABASE_URL");
}
