//! Notification fan-out.
//!
//! `notify` produces three independent effects for one event: a realtime message on
//! the user's channel, a persisted [`Notification`], and a device push when the user
//! has a registered token. A failing effect is logged and never blocks the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use clipforge_core::UserId;
use clipforge_events::{
    Notification, NotificationEvent, RealtimeChannel, event_names, user_channel,
};

use crate::repo::{NotificationStore, RepositoryError};

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("user directory error: {0}")]
    Directory(String),
    #[error("push delivery failed: {0}")]
    Push(String),
    #[error(transparent)]
    Store(#[from] RepositoryError),
}

/// Localized title and message for an event key.
pub trait Translator: Send + Sync {
    fn translate(
        &self,
        language: &str,
        key: &str,
        params: &BTreeMap<String, String>,
    ) -> (String, String);
}

/// Built-in English templates. Unknown keys fall back to the key itself.
#[derive(Debug, Clone)]
pub struct StaticTranslator {
    templates: HashMap<String, (String, String)>,
}

impl Default for StaticTranslator {
    fn default() -> Self {
        let mut templates = HashMap::new();
        for (kind, label) in [
            ("story", "story"),
            ("effect", "effect"),
            ("generationLib", "generation"),
        ] {
            templates.insert(
                format!("{kind}.completed"),
                (
                    format!("Your {label} is ready"),
                    format!("Your {label} finished generating. Tap to view it."),
                ),
            );
            templates.insert(
                format!("{kind}.failed"),
                (
                    format!("Your {label} could not be generated"),
                    "Something went wrong. {credits} credits were returned to your balance."
                        .to_string(),
                ),
            );
            templates.insert(
                format!("{kind}.failed_no_refund"),
                (
                    format!("Your {label} could not be generated"),
                    "Something went wrong. Please try again.".to_string(),
                ),
            );
        }
        Self { templates }
    }
}

impl StaticTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(
        mut self,
        key: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.templates.insert(key.into(), (title.into(), message.into()));
        self
    }
}

fn interpolate(template: &str, params: &BTreeMap<String, String>) -> String {
    params.iter().fold(template.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{k}}}"), v)
    })
}

impl Translator for StaticTranslator {
    fn translate(
        &self,
        _language: &str,
        key: &str,
        params: &BTreeMap<String, String>,
    ) -> (String, String) {
        match self.templates.get(key) {
            Some((title, message)) => (interpolate(title, params), interpolate(message, params)),
            None => (key.to_string(), key.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub language: String,
    pub device_token: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, NotificationError>;
}

/// In-memory user directory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<UserId, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, user_id: UserId, profile: UserProfile) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(user_id, profile);
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, NotificationError> {
        let users = self
            .users
            .lock()
            .map_err(|_| NotificationError::Directory("directory lock poisoned".to_string()))?;
        Ok(users.get(&user_id).cloned())
    }
}

/// Push-notification provider. `data` values are already flattened to strings.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn push_to_device(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedMessage {
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

/// Records pushes instead of sending them; can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryPushDelivery {
    sent: Mutex<Vec<PushedMessage>>,
    failing: Mutex<bool>,
}

impl InMemoryPushDelivery {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }

    pub fn sent(&self) -> Vec<PushedMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushDelivery for InMemoryPushDelivery {
    async fn push_to_device(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(NotificationError::Push("push provider unavailable".to_string()));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| NotificationError::Push("push log lock poisoned".to_string()))?;
        sent.push(PushedMessage {
            device_token: device_token.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            data: data.clone(),
        });
        Ok(())
    }
}

/// Logs pushes at debug level. Used when no push provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPushDelivery;

#[async_trait]
impl PushDelivery for LoggingPushDelivery {
    async fn push_to_device(
        &self,
        device_token: &str,
        title: &str,
        _body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        debug!(device_token, title, fields = data.len(), "push skipped: no provider configured");
        Ok(())
    }
}

/// Which effects of one `notify` call went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub realtime: bool,
    pub persisted: bool,
    pub pushed: bool,
}

#[derive(Clone)]
pub struct Notifier {
    translator: Arc<dyn Translator>,
    users: Arc<dyn UserDirectory>,
    push: Arc<dyn PushDelivery>,
    store: Arc<dyn NotificationStore>,
    realtime: Arc<dyn RealtimeChannel>,
    ttl: chrono::Duration,
}

impl Notifier {
    pub fn new(
        translator: Arc<dyn Translator>,
        users: Arc<dyn UserDirectory>,
        push: Arc<dyn PushDelivery>,
        store: Arc<dyn NotificationStore>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Self {
        Self {
            translator,
            users,
            push,
            store,
            realtime,
            ttl: chrono::Duration::days(clipforge_events::notification::DEFAULT_TTL_DAYS),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn notify(&self, user_id: UserId, event: &NotificationEvent) -> NotifyReport {
        let mut report = NotifyReport::default();

        let profile = match self.users.profile(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(%user_id, error = %e, "user profile lookup failed; using defaults");
                None
            }
        };
        let language = profile
            .as_ref()
            .map(|p| p.language.as_str())
            .unwrap_or(DEFAULT_LANGUAGE);
        let (title, message) = self.translator.translate(language, &event.key, &event.params);

        let notification =
            Notification::from_event(user_id, event, title, message, Utc::now(), self.ttl);

        match serde_json::to_value(&notification) {
            Ok(payload) => {
                self.realtime
                    .emit(&user_channel(user_id), event_names::NOTIFICATION, payload);
                report.realtime = true;
            }
            Err(e) => warn!(%user_id, key = %event.key, error = %e, "notification not serializable"),
        }

        match self.store.insert(&notification).await {
            Ok(()) => report.persisted = true,
            Err(e) => warn!(%user_id, key = %event.key, error = %e, "failed to persist notification"),
        }

        if let Some(token) = profile.as_ref().and_then(|p| p.device_token.as_deref()) {
            match self
                .push
                .push_to_device(
                    token,
                    &notification.title,
                    &notification.message,
                    &event.flattened_data(),
                )
                .await
            {
                Ok(()) => report.pushed = true,
                Err(e) => warn!(%user_id, key = %event.key, error = %e, "push delivery failed"),
            }
        }

        debug!(%user_id, key = %event.key, ?report, "notification fanned out");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryNotificationStore;
    use clipforge_core::{JobId, RecordId};
    use clipforge_events::InMemoryRealtimeHub;
    use clipforge_generation::JobKind;

    struct Fixture {
        notifier: Notifier,
        users: Arc<InMemoryUserDirectory>,
        push: Arc<InMemoryPushDelivery>,
        store: Arc<InMemoryNotificationStore>,
        hub: Arc<InMemoryRealtimeHub>,
    }

    fn fixture() -> Fixture {
        let users = InMemoryUserDirectory::arc();
        let push = InMemoryPushDelivery::arc();
        let store = InMemoryNotificationStore::arc();
        let hub = Arc::new(InMemoryRealtimeHub::new());
        let notifier = Notifier::new(
            Arc::new(StaticTranslator::new()),
            users.clone(),
            push.clone(),
            store.clone(),
            hub.clone(),
        );
        Fixture {
            notifier,
            users,
            push,
            store,
            hub,
        }
    }

    fn failed_event() -> NotificationEvent {
        NotificationEvent::job_failed(
            JobKind::Story,
            &JobId::generate(),
            RecordId::new(),
            "provider failed",
            30,
        )
    }

    #[tokio::test]
    async fn all_three_effects_apply_for_a_user_with_a_device() {
        let f = fixture();
        let user = UserId::new();
        f.users.insert(
            user,
            UserProfile {
                language: "en".to_string(),
                device_token: Some("device-1".to_string()),
            },
        );
        let mut sub = f.hub.subscribe(user_channel(user));

        let report = f.notifier.notify(user, &failed_event()).await;

        assert_eq!(
            report,
            NotifyReport {
                realtime: true,
                persisted: true,
                pushed: true
            }
        );
        let stored = f.store.list_for_user(user).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].message.contains("30 credits"));

        let messages = sub.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, event_names::NOTIFICATION);

        let pushed = f.push.sent();
        assert_eq!(pushed[0].device_token, "device-1");
        assert_eq!(pushed[0].data.get("refunded").map(String::as_str), Some("30"));
    }

    #[tokio::test]
    async fn push_failure_does_not_block_persistence() {
        let f = fixture();
        let user = UserId::new();
        f.users.insert(
            user,
            UserProfile {
                language: "en".to_string(),
                device_token: Some("device-1".to_string()),
            },
        );
        f.push.set_failing(true);

        let report = f.notifier.notify(user, &failed_event()).await;

        assert!(!report.pushed);
        assert!(report.persisted);
        assert!(report.realtime);
    }

    #[tokio::test]
    async fn store_failure_does_not_block_push() {
        let f = fixture();
        let user = UserId::new();
        f.users.insert(
            user,
            UserProfile {
                language: "en".to_string(),
                device_token: Some("device-1".to_string()),
            },
        );
        f.store.fail_writes(true);

        let report = f.notifier.notify(user, &failed_event()).await;

        assert!(!report.persisted);
        assert!(report.pushed);
    }

    #[tokio::test]
    async fn unknown_user_gets_no_push() {
        let f = fixture();
        let report = f.notifier.notify(UserId::new(), &failed_event()).await;
        assert!(!report.pushed);
        assert!(report.persisted);
        assert!(f.push.sent().is_empty());
    }

    #[tokio::test]
    async fn failure_without_refund_does_not_mention_credits() {
        let f = fixture();
        let user = UserId::new();
        let event = NotificationEvent::job_failed(
            JobKind::Effect,
            &JobId::generate(),
            RecordId::new(),
            "provider failed",
            0,
        );

        let report = f.notifier.notify(user, &event).await;

        assert!(report.persisted);
        let stored = f.store.list_for_user(user).await.unwrap();
        assert_eq!(stored[0].title, "Your effect could not be generated");
        assert!(!stored[0].message.contains("credits"));
    }

    #[test]
    fn unknown_key_falls_back_to_key() {
        let t = StaticTranslator::new();
        let (title, message) = t.translate("en", "custom.key", &BTreeMap::new());
        assert_eq!(title, "custom.key");
        assert_eq!(message, "custom.key");
    }
}
