//! Realtime events and notifications.
//!
//! - `channel`: fire-and-forget realtime channel abstraction + user channel naming
//! - `hub`: in-process broadcast hub (backs the SSE endpoint and tests)
//! - `queue_event`: ephemeral job progress events
//! - `notification`: persisted in-app notification and the domain event that produces it

pub mod channel;
pub mod hub;
pub mod notification;
pub mod queue_event;

pub use channel::{ChannelMessage, RealtimeChannel, user_channel};
pub use hub::{ChannelSubscription, InMemoryRealtimeHub};
pub use notification::{Notification, NotificationCategory, NotificationEvent};
pub use queue_event::{QueueEvent, event_names};
