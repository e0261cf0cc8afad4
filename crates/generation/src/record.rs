//! User-visible generation artifact (story, effect item, library item).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::{Entity, JobId, RecordId, UserId};

use crate::job::{JobKind, JobStatus};
use crate::output::GenerationOutput;

/// Generation record owned by a user.
///
/// Created `pending` at submission, moved to `completed` or `failed` only by the
/// outcome handlers; the pipeline executors never touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub id: RecordId,
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub is_favorite: bool,
    pub duration_secs: f64,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn pending(
        id: RecordId,
        job_id: JobId,
        user_id: UserId,
        kind: JobKind,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id,
            user_id,
            kind,
            status: JobStatus::Pending,
            result_url: None,
            thumbnail: None,
            title: None,
            error: None,
            is_favorite: false,
            duration_secs: 0.0,
            credits,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_completed(&mut self, output: &GenerationOutput, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result_url = Some(output.result_url.clone());
        self.thumbnail = output.thumbnail.clone();
        self.title = output.title.clone();
        self.duration_secs = output.duration_secs;
        self.error = None;
        self.updated_at = now;
    }

    /// Failed records never expose partial results.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.result_url = None;
        self.thumbnail = None;
        self.error = Some(error.into());
        self.updated_at = now;
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.error = None;
        self.updated_at = now;
    }
}

impl Entity for GenerationRecord {
    type Id = RecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
