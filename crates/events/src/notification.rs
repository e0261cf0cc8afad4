//! In-app notifications and the domain events that produce them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::{Entity, JobId, NotificationId, RecordId, UserId};
use clipforge_generation::JobKind;

pub const DEFAULT_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Generation,
    Credits,
    System,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Generation => "generation",
            NotificationCategory::Credits => "credits",
            NotificationCategory::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generation" => Some(NotificationCategory::Generation),
            "credits" => Some(NotificationCategory::Credits),
            "system" => Some(NotificationCategory::System),
            _ => None,
        }
    }
}

/// Domain event handed to the notification fan-out.
///
/// `key` is a translation key; `params` are interpolated into the localized title
/// and message. `data` travels with the notification as structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub key: String,
    pub category: NotificationCategory,
    #[serde(default)]
    pub redirect_to: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl NotificationEvent {
    pub fn new(key: impl Into<String>, category: NotificationCategory) -> Self {
        Self {
            key: key.into(),
            category,
            redirect_to: None,
            data: serde_json::Map::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_redirect(mut self, redirect_to: impl Into<String>) -> Self {
        self.redirect_to = Some(redirect_to.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// `<kind>.completed`, with the result URL in `data`.
    pub fn job_completed(
        kind: JobKind,
        job_id: &JobId,
        record_id: RecordId,
        result_url: &str,
    ) -> Self {
        Self::new(format!("{}.completed", kind.as_str()), NotificationCategory::Generation)
            .with_redirect(redirect_for(kind, record_id))
            .with_data("jobId", job_id.as_str())
            .with_data("recordId", record_id.to_string())
            .with_data("kind", kind.as_str())
            .with_data("resultUrl", result_url)
    }

    /// `<kind>.failed` with the refunded amount as the `credits` param, or
    /// `<kind>.failed_no_refund` when nothing was returned. `data` always carries it.
    pub fn job_failed(
        kind: JobKind,
        job_id: &JobId,
        record_id: RecordId,
        error: &str,
        refunded: i64,
    ) -> Self {
        let key = if refunded > 0 {
            format!("{}.failed", kind.as_str())
        } else {
            format!("{}.failed_no_refund", kind.as_str())
        };
        let event = Self::new(key, NotificationCategory::Generation)
            .with_redirect(redirect_for(kind, record_id))
            .with_data("jobId", job_id.as_str())
            .with_data("recordId", record_id.to_string())
            .with_data("kind", kind.as_str())
            .with_data("error", error)
            .with_data("refunded", refunded);
        if refunded > 0 {
            event.with_param("credits", refunded.to_string())
        } else {
            event
        }
    }

    /// Data map with every value flattened to a string (push payload format).
    pub fn flattened_data(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .map(|(k, v)| {
                let flat = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), flat)
            })
            .collect()
    }
}

fn redirect_for(kind: JobKind, record_id: RecordId) -> String {
    format!("/library/{}/{}", kind.as_str(), record_id)
}

/// Persisted in-app notification. Append-only per user, expires after its TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub redirect_to: Option<String>,
    pub category: NotificationCategory,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Notification {
    pub fn from_event(
        user_id: UserId,
        event: &NotificationEvent,
        title: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            user_id,
            title: title.into(),
            message: message.into(),
            data: serde_json::Value::Object(event.data.clone()),
            redirect_to: event.redirect_to.clone(),
            category: event.category,
            created_at: now,
            expires_at: now + ttl,
            is_read: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl Entity for Notification {
    type Id = NotificationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_is_flattened_to_strings() {
        let ev = NotificationEvent::job_failed(
            JobKind::Story,
            &JobId::parse("job-1").unwrap(),
            RecordId::new(),
            "provider timeout",
            40,
        )
        .with_data("nested", serde_json::json!({"a": 1}))
        .with_data("none", serde_json::Value::Null);

        let flat = ev.flattened_data();
        assert_eq!(flat["jobId"], "job-1");
        assert_eq!(flat["refunded"], "40");
        assert_eq!(flat["nested"], r#"{"a":1}"#);
        assert_eq!(flat["none"], "");
        assert_eq!(ev.params["credits"], "40");
        assert_eq!(ev.key, "story.failed");
    }

    #[test]
    fn failure_without_refund_uses_its_own_key() {
        let ev = NotificationEvent::job_failed(
            JobKind::Effect,
            &JobId::parse("job-2").unwrap(),
            RecordId::new(),
            "provider timeout",
            0,
        );

        assert_eq!(ev.key, "effect.failed_no_refund");
        assert!(!ev.params.contains_key("credits"));
        assert_eq!(ev.flattened_data()["refunded"], "0");
    }

    #[test]
    fn notifications_expire_after_ttl() {
        let now = Utc::now();
        let ev = NotificationEvent::new("system.hello", NotificationCategory::System);
        let n = Notification::from_event(
            UserId::new(),
            &ev,
            "Hello",
            "World",
            now,
            Duration::days(DEFAULT_TTL_DAYS),
        );
        assert!(!n.is_read);
        assert!(!n.is_expired(now + Duration::days(6)));
        assert!(n.is_expired(now + Duration::days(7)));
    }
}
