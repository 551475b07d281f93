use super::*;

fn settings() -> TypingSettings {
    TypingSettings {
        debounce_ms: 500,
        auto_stop_ms: 10_000,
        hard_cap_ms: 30_000,
        sweep_interval_ms: 5_000,
    }
}

fn manager_with(
    settings: TypingSettings,
) -> (
    Arc<TypingIndicatorManager>,
    mpsc::Receiver<TypingBroadcast>,
    broadcast::Receiver<MessagingEvent>,
) {
    let (events_tx, events_rx) = broadcast::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let profile = LocalProfile {
        user_id: UserId(7),
        display_name: "alice".to_string(),
    };
    let manager = TypingIndicatorManager::new(profile, settings, events_tx, outbound_tx);
    (manager, outbound_rx, events_rx)
}

fn remote(user_id: i64, name: &str, conversation: i64, is_typing: bool) -> TypingPayload {
    TypingPayload {
        conversation_id: ConversationId(conversation),
        user_id: UserId(user_id),
        user_name: name.to_string(),
        is_typing,
    }
}

fn drain_outbound(rx: &mut mpsc::Receiver<TypingBroadcast>) -> Vec<TypingBroadcast> {
    let mut drained = Vec::new();
    while let Ok(broadcast) = rx.try_recv() {
        drained.push(broadcast);
    }
    drained
}

fn is_typing_flag(broadcast: &TypingBroadcast) -> bool {
    match &broadcast.event {
        OutboundEvent::Typing { typing } => typing.is_typing,
        other => panic!("unexpected outbound event: {other:?}"),
    }
}

#[tokio::test]
async fn rapid_keystrokes_collapse_to_one_broadcast_per_window() {
    let (manager, mut outbound, _events) = manager_with(settings());
    let conversation = ConversationId(1);

    for _ in 0..10 {
        manager.start_typing(conversation);
    }

    let broadcasts = drain_outbound(&mut outbound);
    assert_eq!(broadcasts.len(), 1, "debounce must collapse keystrokes");
    assert!(is_typing_flag(&broadcasts[0]));
}

#[tokio::test]
async fn sustained_typing_rebroadcasts_after_the_window() {
    let (manager, mut outbound, _events) = manager_with(TypingSettings {
        debounce_ms: 50,
        ..settings()
    });
    let conversation = ConversationId(1);

    manager.start_typing(conversation);
    manager.start_typing(conversation);
    tokio::time::sleep(Duration::from_millis(80)).await;
    manager.start_typing(conversation);

    let broadcasts = drain_outbound(&mut outbound);
    assert_eq!(broadcasts.len(), 2);
}

#[tokio::test]
async fn stop_typing_is_never_debounced() {
    let (manager, mut outbound, _events) = manager_with(settings());
    let conversation = ConversationId(1);

    manager.start_typing(conversation);
    manager.stop_typing(conversation);

    let broadcasts = drain_outbound(&mut outbound);
    assert_eq!(broadcasts.len(), 2);
    assert!(is_typing_flag(&broadcasts[0]));
    assert!(!is_typing_flag(&broadcasts[1]));

    // The state is gone, so a second stop is a no-op.
    manager.stop_typing(conversation);
    assert!(drain_outbound(&mut outbound).is_empty());

    // And the next keystroke broadcasts immediately again.
    manager.start_typing(conversation);
    assert_eq!(drain_outbound(&mut outbound).len(), 1);
}

#[tokio::test]
async fn at_most_one_state_per_user_and_conversation() {
    let (manager, _outbound, mut events) = manager_with(settings());

    manager.apply_remote(&remote(21, "bob", 1, true));
    manager.apply_remote(&remote(21, "bob", 1, true));
    manager.apply_remote(&remote(21, "bob", 2, true));

    assert_eq!(manager.states(ConversationId(1)).len(), 1);
    assert_eq!(manager.states(ConversationId(2)).len(), 1);

    // Only the first upsert per pair announces a change.
    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MessagingEvent::TypingChanged { is_typing: true, .. }) {
            started += 1;
        }
    }
    assert_eq!(started, 2);
}

#[tokio::test]
async fn self_echoes_are_ignored() {
    let (manager, _outbound, _events) = manager_with(settings());
    manager.apply_remote(&remote(7, "alice", 1, true));
    assert!(manager.states(ConversationId(1)).is_empty());
}

#[tokio::test]
async fn sweep_expires_idle_remote_state_exactly_once() {
    let (manager, mut outbound, mut events) = manager_with(TypingSettings {
        auto_stop_ms: 40,
        ..settings()
    });

    manager.apply_remote(&remote(21, "bob", 1, true));
    while events.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(70)).await;
    manager.sweep();
    manager.sweep();

    let mut stops = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MessagingEvent::TypingChanged { is_typing: false, .. }) {
            stops += 1;
        }
    }
    assert_eq!(stops, 1, "expiry must emit exactly one stop");
    assert!(manager.states(ConversationId(1)).is_empty());

    // Remote expiry never produces an outbound broadcast on our behalf.
    assert!(drain_outbound(&mut outbound).is_empty());
}

#[tokio::test]
async fn hard_cap_stops_local_typing_despite_constant_activity() {
    let (manager, mut outbound, _events) = manager_with(TypingSettings {
        debounce_ms: 10_000,
        auto_stop_ms: 10_000,
        hard_cap_ms: 60,
        ..settings()
    });
    let conversation = ConversationId(1);

    manager.start_typing(conversation);
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        manager.start_typing(conversation);
    }
    manager.sweep();

    let broadcasts = drain_outbound(&mut outbound);
    assert!(is_typing_flag(broadcasts.first().expect("initial start")));
    assert!(
        !is_typing_flag(broadcasts.last().expect("synthetic stop")),
        "hard cap must force an outbound stop"
    );
    assert!(manager.states(conversation).is_empty());
}

#[tokio::test]
async fn typing_text_renders_names_in_arrival_order() {
    let (manager, _outbound, _events) = manager_with(settings());
    let conversation = ConversationId(1);

    assert_eq!(manager.typing_text(conversation), None);

    manager.apply_remote(&remote(21, "bob", 1, true));
    assert_eq!(
        manager.typing_text(conversation).as_deref(),
        Some("bob is typing…")
    );

    manager.apply_remote(&remote(22, "carol", 1, true));
    assert_eq!(
        manager.typing_text(conversation).as_deref(),
        Some("bob and carol are typing…")
    );

    manager.apply_remote(&remote(23, "dave", 1, true));
    manager.apply_remote(&remote(24, "erin", 1, true));
    assert_eq!(
        manager.typing_text(conversation).as_deref(),
        Some("bob and 3 others are typing…")
    );

    // The local user's own typing never shows up in the summary.
    manager.start_typing(conversation);
    assert_eq!(
        manager.typing_text(conversation).as_deref(),
        Some("bob and 3 others are typing…")
    );
}

#[tokio::test]
async fn efficient_mode_doubles_debounce_and_halves_auto_stop() {
    let (manager, mut outbound, _events) = manager_with(TypingSettings {
        debounce_ms: 40,
        auto_stop_ms: 100,
        ..settings()
    });
    manager.set_efficient(true);
    let conversation = ConversationId(1);

    // Effective debounce is 80ms: a keystroke 50ms later stays quiet.
    manager.start_typing(conversation);
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.start_typing(conversation);
    assert_eq!(drain_outbound(&mut outbound).len(), 1);

    // Effective auto-stop is 50ms: the state expires early.
    tokio::time::sleep(Duration::from_millis(70)).await;
    manager.sweep();
    assert!(manager.states(conversation).is_empty());
}
