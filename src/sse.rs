//! Per-round SSE pub/sub bus: an in-memory `round_id -> [queue]` fan-out
//! backed by a bounded `tokio::sync::mpsc` channel per subscriber.
//! `done`/`error` publish via a blocking `send` so they are never
//! dropped, everything else via `try_send` so a slow subscriber degrades
//! by losing frames rather than backpressuring the publisher.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::model::AiMessage;

/// Bounded channel capacity per subscriber.
const CHANNEL_CAPACITY: usize = 256;

/// Idle-connection keepalive interval for the HTTP streaming layer.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// One frame published onto a round's event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Assistant { content: String },
    Tool { content: String },
    User { content: String },
    Workspace { content: String },
    DocUpdated { filename: String, content: String },
    /// Legacy alias of `DocUpdated`, emitted alongside it when the
    /// updated document is the PRD, for clients still reading the old
    /// event name.
    PrdUpdated { filename: String, content: String },
    Done,
    Error { message: String },
    Info { content: String },
}

impl Event {
    /// `done` and `error` are the two terminal types that must never be
    /// dropped by a full subscriber channel.
    fn is_terminal(&self) -> bool {
        matches!(self, Event::Done | Event::Error { .. })
    }
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
}

/// In-memory publish/subscribe bus, one logical topic per round.
#[derive(Clone)]
pub struct SseBus {
    subscribers: Arc<RwLock<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl Default for SseBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SseBus {
    pub fn new() -> Self {
        SseBus { subscribers: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Subscribe to a round's live stream. Returns the receiving half; the
    /// caller is responsible for replaying persisted history before
    /// consuming from it, per the two stream modes in
    /// [`crate::sse::ReplayMode`].
    pub async fn subscribe(&self, round_id: Uuid) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.write().await.entry(round_id).or_default().push(Subscriber { tx });
        rx
    }

    /// Publish `event` to every live subscriber of `round_id`. Dead
    /// senders (receiver dropped) are pruned as they're discovered.
    pub async fn publish(&self, round_id: Uuid, event: Event) {
        let mut guard = self.subscribers.write().await;
        let Some(subs) = guard.get_mut(&round_id) else { return };
        let mut dead = Vec::new();
        for (idx, sub) in subs.iter().enumerate() {
            let outcome = if event.is_terminal() {
                sub.tx.send(event.clone()).await.is_err()
            } else {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => false,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("sse subscriber for round {round_id} is full, dropping frame");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => true,
                }
            };
            if outcome {
                dead.push(idx);
            }
        }
        for idx in dead.into_iter().rev() {
            subs.remove(idx);
        }
        if subs.is_empty() {
            guard.remove(&round_id);
        }
    }

    /// Drop all subscribers for a round, e.g. once a story reaches
    /// `Done` and no further events will be published.
    pub async fn close(&self, round_id: Uuid) {
        self.subscribers.write().await.remove(&round_id);
    }
}

/// Which slice of persisted history a stream replays before switching to
/// live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Replay everything, close the stream after the first `done`/`error`.
    Default,
    /// Replay only from the first `user`-role message onward; keep the
    /// connection open past `done` so the next chat turn continues on the
    /// same stream.
    Chat,
}

/// Build the ordered replay events for `history` under `mode`.
pub fn replay_events(history: &[AiMessage], mode: ReplayMode) -> Vec<Event> {
    use crate::model::MessageRole;

    let start = match mode {
        ReplayMode::Default => 0,
        ReplayMode::Chat => history
            .iter()
            .position(|m| m.role == MessageRole::User)
            .unwrap_or(history.len()),
    };
    history[start..]
        .iter()
        .map(|m| match m.role {
            MessageRole::Assistant => Event::Assistant { content: m.content.clone() },
            MessageRole::Tool => Event::Tool { content: m.content.clone() },
            MessageRole::User => Event::User { content: m.content.clone() },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;
    use chrono::Utc;

    fn msg(role: MessageRole, content: &str) -> AiMessage {
        AiMessage { id: Uuid::new_v4(), round_id: Uuid::new_v4(), role, content: content.to_string(), created_at: Utc::now() }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = SseBus::new();
        bus.publish(Uuid::new_v4(), Event::Done).await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = SseBus::new();
        let round_id = Uuid::new_v4();
        let mut rx = bus.subscribe(round_id).await;
        bus.publish(round_id, Event::Assistant { content: "hi".to_string() }).await;
        bus.publish(round_id, Event::Done).await;

        let first = rx.recv().await.unwrap();
        matches!(first, Event::Assistant { .. });
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::Done));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = SseBus::new();
        let round_id = Uuid::new_v4();
        let rx = bus.subscribe(round_id).await;
        drop(rx);
        bus.publish(round_id, Event::Info { content: "x".to_string() }).await;
        assert!(bus.subscribers.read().await.get(&round_id).is_none());
    }

    #[test]
    fn default_replay_includes_everything() {
        let history = vec![msg(MessageRole::Assistant, "a"), msg(MessageRole::User, "b")];
        let events = replay_events(&history, ReplayMode::Default);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn chat_replay_starts_at_first_user_message() {
        let history = vec![
            msg(MessageRole::Assistant, "a"),
            msg(MessageRole::Tool, "t"),
            msg(MessageRole::User, "q"),
            msg(MessageRole::Assistant, "r"),
        ];
        let events = replay_events(&history, ReplayMode::Chat);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::User { .. }));
    }
}
