use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use shared::{
    domain::{ConversationId, TypingState, UserId},
    protocol::{OutboundEvent, TypingPayload},
};

use crate::{config::TypingSettings, delivery::LocalProfile, events::MessagingEvent};

/// Outbound presence broadcast handed to the channel layer over a pump;
/// delivery is best-effort and failures never reach the user.
#[derive(Debug)]
pub struct TypingBroadcast {
    pub conversation_id: ConversationId,
    pub event: OutboundEvent,
}

struct Entry {
    state: TypingState,
    deadline: Instant,
    hard_cap_at: Instant,
    local: bool,
}

struct TypingInner {
    states: HashMap<(UserId, ConversationId), Entry>,
    last_broadcast: HashMap<ConversationId, Instant>,
    efficient: bool,
}

/// Converts local keystroke activity into a rate-limited, auto-expiring
/// presence broadcast, and mirrors remote users' typing state for display.
pub struct TypingIndicatorManager {
    profile: LocalProfile,
    settings: TypingSettings,
    events: broadcast::Sender<MessagingEvent>,
    outbound: mpsc::Sender<TypingBroadcast>,
    inner: Mutex<TypingInner>,
}

impl TypingIndicatorManager {
    pub fn new(
        profile: LocalProfile,
        settings: TypingSettings,
        events: broadcast::Sender<MessagingEvent>,
        outbound: mpsc::Sender<TypingBroadcast>,
    ) -> Arc<Self> {
        Arc::new(Self {
            profile,
            settings,
            events,
            outbound,
            inner: Mutex::new(TypingInner {
                states: HashMap::new(),
                last_broadcast: HashMap::new(),
                efficient: false,
            }),
        })
    }

    fn debounce(&self, efficient: bool) -> Duration {
        let factor = if efficient { 2 } else { 1 };
        Duration::from_millis(self.settings.debounce_ms * factor)
    }

    fn auto_stop(&self, efficient: bool) -> Duration {
        let divisor = if efficient { 2 } else { 1 };
        Duration::from_millis(self.settings.auto_stop_ms / divisor)
    }

    fn payload(&self, conversation_id: ConversationId, is_typing: bool) -> TypingPayload {
        TypingPayload {
            conversation_id,
            user_id: self.profile.user_id,
            user_name: self.profile.display_name.clone(),
            is_typing,
        }
    }

    fn broadcast(&self, conversation_id: ConversationId, is_typing: bool) {
        let sent = self.outbound.try_send(TypingBroadcast {
            conversation_id,
            event: OutboundEvent::Typing {
                typing: self.payload(conversation_id, is_typing),
            },
        });
        if sent.is_err() {
            debug!(
                conversation_id = conversation_id.0,
                "typing broadcast dropped"
            );
        }
    }

    /// Local keystroke activity. Broadcasts at most once per debounce
    /// window of sustained typing; the per-user auto-stop deadline is
    /// re-armed on every call.
    pub fn start_typing(&self, conversation_id: ConversationId) {
        let now = Instant::now();
        let should_broadcast = {
            let mut inner = self.inner.lock().expect("typing state poisoned");
            let efficient = inner.efficient;
            let deadline = now + self.auto_stop(efficient);
            let hard_cap = Duration::from_millis(self.settings.hard_cap_ms);

            let key = (self.profile.user_id, conversation_id);
            let user_id = self.profile.user_id;
            let user_name = self.profile.display_name.clone();
            inner
                .states
                .entry(key)
                .and_modify(|entry| {
                    entry.state.last_activity_at = Utc::now();
                    entry.state.is_typing = true;
                    entry.deadline = deadline;
                })
                .or_insert_with(|| Entry {
                    state: TypingState {
                        user_id,
                        user_name,
                        conversation_id,
                        is_typing: true,
                        started_at: Utc::now(),
                        last_activity_at: Utc::now(),
                    },
                    deadline,
                    hard_cap_at: now + hard_cap,
                    local: true,
                });

            let debounce = self.debounce(efficient);
            let due = inner
                .last_broadcast
                .get(&conversation_id)
                .is_none_or(|at| at.elapsed() >= debounce);
            if due {
                inner.last_broadcast.insert(conversation_id, now);
            }
            due
        };

        if should_broadcast {
            self.broadcast(conversation_id, true);
        }
    }

    /// Never debounced: broadcasts immediately and clears the state.
    pub fn stop_typing(&self, conversation_id: ConversationId) {
        let removed = {
            let mut inner = self.inner.lock().expect("typing state poisoned");
            inner.last_broadcast.remove(&conversation_id);
            inner
                .states
                .remove(&(self.profile.user_id, conversation_id))
                .is_some()
        };

        if removed {
            self.broadcast(conversation_id, false);
        }
    }

    /// Mirrors a remote user's typing signal. Self-echoes are ignored.
    pub fn apply_remote(&self, payload: &TypingPayload) {
        if payload.user_id == self.profile.user_id {
            return;
        }

        let now = Instant::now();
        let changed = {
            let mut inner = self.inner.lock().expect("typing state poisoned");
            let efficient = inner.efficient;
            let key = (payload.user_id, payload.conversation_id);
            if payload.is_typing {
                let deadline = now + self.auto_stop(efficient);
                let hard_cap = Duration::from_millis(self.settings.hard_cap_ms);
                match inner.states.get_mut(&key) {
                    Some(entry) => {
                        entry.state.last_activity_at = Utc::now();
                        entry.deadline = deadline;
                        false
                    }
                    None => {
                        inner.states.insert(
                            key,
                            Entry {
                                state: TypingState {
                                    user_id: payload.user_id,
                                    user_name: payload.user_name.clone(),
                                    conversation_id: payload.conversation_id,
                                    is_typing: true,
                                    started_at: Utc::now(),
                                    last_activity_at: Utc::now(),
                                },
                                deadline,
                                hard_cap_at: now + hard_cap,
                                local: false,
                            },
                        );
                        true
                    }
                }
            } else {
                inner.states.remove(&key).is_some()
            }
        };

        if changed {
            let _ = self.events.send(MessagingEvent::TypingChanged {
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
                is_typing: payload.is_typing,
            });
        }
    }

    /// Expires idle and over-cap states; each removal emits exactly one
    /// stop. Only the local user's states produce an outbound broadcast.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(TypingState, bool)> = {
            let mut inner = self.inner.lock().expect("typing state poisoned");
            let keys: Vec<(UserId, ConversationId)> = inner
                .states
                .iter()
                .filter(|(_, entry)| entry.deadline <= now || entry.hard_cap_at <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| inner.states.remove(&key))
                .map(|entry| (entry.state, entry.local))
                .collect()
        };

        for (state, local) in expired {
            debug!(
                conversation_id = state.conversation_id.0,
                user_id = state.user_id.0,
                "typing state expired"
            );
            let _ = self.events.send(MessagingEvent::TypingChanged {
                conversation_id: state.conversation_id,
                user_id: state.user_id,
                is_typing: false,
            });
            if local {
                self.broadcast(state.conversation_id, false);
            }
        }
    }

    /// Human-readable summary of who is typing, excluding the local user.
    /// Pure rendering over current state.
    pub fn typing_text(&self, conversation_id: ConversationId) -> Option<String> {
        let mut entries: Vec<(chrono::DateTime<Utc>, String)> = {
            let inner = self.inner.lock().expect("typing state poisoned");
            inner
                .states
                .values()
                .filter(|entry| {
                    entry.state.conversation_id == conversation_id
                        && entry.state.user_id != self.profile.user_id
                        && entry.state.is_typing
                })
                .map(|entry| (entry.state.started_at, entry.state.user_name.clone()))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let names: Vec<String> = entries.into_iter().map(|(_, name)| name).collect();

        match names.as_slice() {
            [] => None,
            [one] => Some(format!("{one} is typing…")),
            [one, two] => Some(format!("{one} and {two} are typing…")),
            [first, rest @ ..] => Some(format!(
                "{first} and {} others are typing…",
                rest.len()
            )),
        }
    }

    /// Doubles the debounce and halves the auto-stop delay.
    pub fn set_efficient(&self, on: bool) {
        self.inner.lock().expect("typing state poisoned").efficient = on;
    }

    pub fn is_efficient(&self) -> bool {
        self.inner.lock().expect("typing state poisoned").efficient
    }

    pub fn states(&self, conversation_id: ConversationId) -> Vec<TypingState> {
        self.inner
            .lock()
            .expect("typing state poisoned")
            .states
            .values()
            .filter(|entry| entry.state.conversation_id == conversation_id)
            .map(|entry| entry.state.clone())
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
