//! In-process realtime hub backed by a tokio broadcast channel.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::channel::{ChannelMessage, RealtimeChannel};

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast hub. Every subscription sees every message and filters by channel.
///
/// - No persistence
/// - Lossy under lag (slow subscribers skip ahead)
/// - Emitting with zero subscribers is a no-op
#[derive(Debug, Clone)]
pub struct InMemoryRealtimeHub {
    tx: broadcast::Sender<ChannelMessage>,
}

impl InMemoryRealtimeHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to one channel (typically a user channel).
    pub fn subscribe(&self, channel: impl Into<String>) -> ChannelSubscription {
        ChannelSubscription {
            channel: channel.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryRealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeChannel for InMemoryRealtimeHub {
    fn emit(&self, channel: &str, event: &str, payload: serde_json::Value) {
        // Err only means "no receivers right now".
        if self
            .tx
            .send(ChannelMessage::new(channel, event, payload))
            .is_err()
        {
            debug!(channel, event, "realtime emit dropped: no listeners");
        }
    }
}

/// A subscription filtered to a single channel.
#[derive(Debug)]
pub struct ChannelSubscription {
    channel: String,
    rx: broadcast::Receiver<ChannelMessage>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message on this channel. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.channel == self.channel => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "realtime subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered message on this channel, without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.channel == self.channel => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered for this channel.
    pub fn drain(&mut self) -> Vec<ChannelMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::user_channel;
    use clipforge_core::UserId;

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let hub = InMemoryRealtimeHub::new();
        hub.emit("user:nobody", "job:progress", serde_json::json!({"progress": 10}));

        // Messages are never buffered for late subscribers.
        let mut sub = hub.subscribe("user:nobody");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn subscriptions_only_see_their_channel() {
        let hub = InMemoryRealtimeHub::new();
        let alice = user_channel(UserId::new());
        let bob = user_channel(UserId::new());

        let mut alice_sub = hub.subscribe(alice.clone());
        let mut bob_sub = hub.subscribe(bob.clone());

        hub.emit(&alice, "job:progress", serde_json::json!({"progress": 10}));
        hub.emit(&bob, "job:failed", serde_json::json!({}));
        hub.emit(&alice, "job:completed", serde_json::json!({"progress": 100}));

        let events: Vec<String> = alice_sub.drain().into_iter().map(|m| m.event).collect();
        assert_eq!(events, vec!["job:progress", "job:completed"]);

        let bob_events = bob_sub.drain();
        assert_eq!(bob_events.len(), 1);
        assert_eq!(bob_events[0].event, "job:failed");
    }

    #[tokio::test]
    async fn recv_waits_for_next_matching_message() {
        let hub = InMemoryRealtimeHub::new();
        let mut sub = hub.subscribe("user:a");

        let emitter = hub.clone();
        tokio::spawn(async move {
            emitter.emit("user:b", "noise", serde_json::Value::Null);
            emitter.emit("user:a", "notification", serde_json::json!({"title": "hi"}));
        });

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.event, "notification");
        assert_eq!(msg.payload["title"], "hi");
    }
}
