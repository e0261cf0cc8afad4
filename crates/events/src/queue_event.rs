//! Ephemeral job progress events pushed over the user channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::JobId;
use clipforge_generation::{JobKind, JobStatus};

pub mod event_names {
    pub const JOB_PROGRESS: &str = "job:progress";
    pub const JOB_COMPLETED: &str = "job:completed";
    pub const JOB_FAILED: &str = "job:failed";
    pub const NOTIFICATION: &str = "notification";
}

/// Progress snapshot for one job. Not persisted; last write wins on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent {
    pub fn progress(job_id: JobId, kind: JobKind, progress: u8) -> Self {
        Self {
            job_id,
            kind,
            status: JobStatus::Processing,
            progress: progress.min(100),
            result_url: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(job_id: JobId, kind: JobKind, result_url: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            status: JobStatus::Completed,
            progress: 100,
            result_url: Some(result_url.into()),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(job_id: JobId, kind: JobKind, error: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            status: JobStatus::Failed,
            progress: 0,
            result_url: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Realtime event name for this snapshot.
    pub fn event_name(&self) -> &'static str {
        match self.status {
            JobStatus::Completed => event_names::JOB_COMPLETED,
            JobStatus::Failed => event_names::JOB_FAILED,
            JobStatus::Pending | JobStatus::Processing => event_names::JOB_PROGRESS,
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
