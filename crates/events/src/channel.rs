//! Realtime channel abstraction (mechanics only).
//!
//! Delivery is best-effort: a message emitted while nobody listens on the channel
//! is dropped, never buffered for later delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::UserId;

/// One message on a realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl ChannelMessage {
    pub fn new(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

/// Name of the per-user realtime channel.
pub fn user_channel(user_id: UserId) -> String {
    format!("user:{user_id}")
}

/// Realtime emitter.
///
/// `emit` is fire-and-forget: implementations must not block on slow consumers and
/// must not surface delivery failures to the caller.
pub trait RealtimeChannel: Send + Sync {
    fn emit(&self, channel: &str, event: &str, payload: serde_json::Value);
}

impl<C> RealtimeChannel for Arc<C>
where
    C: RealtimeChannel + ?Sized,
{
    fn emit(&self, channel: &str, event: &str, payload: serde_json::Value) {
        (**self).emit(channel, event, payload)
    }
}
