//! Persistence ports for jobs, generation records and notifications.
//!
//! Status changes on jobs are conditional updates: each transition names the states it
//! may start from and reports whether it applied. The failure path relies on this to
//! refund at most once per job.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use clipforge_core::{JobId, RecordId, UserId};
use clipforge_events::Notification;
use clipforge_generation::{GenerationOutput, GenerationRecord, Job, JobStatus};
use clipforge_pipeline::{JobLookup, LookupError};

pub use memory::{InMemoryJobRepository, InMemoryNotificationStore, InMemoryRecordRepository};
pub use postgres::{
    PgCreditStore, PgJobRepository, PgNotificationStore, PgRecordRepository, PgUserDirectory,
    migrate,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job; an existing `job_id` is a `Conflict`.
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, RepositoryError>;

    /// `pending → processing`; `true` if it applied.
    async fn mark_processing(&self, job_id: &JobId, now: DateTime<Utc>)
    -> Result<bool, RepositoryError>;

    /// `pending | processing → completed`; the updated job if it applied.
    async fn complete(
        &self,
        job_id: &JobId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    /// `pending | processing → failed`; the updated job if it applied.
    async fn fail(
        &self,
        job_id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    /// `failed → pending`; the updated job if it applied.
    async fn reset_for_retry(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn insert(&self, record: &GenerationRecord) -> Result<(), RepositoryError>;

    async fn get(&self, id: RecordId) -> Result<Option<GenerationRecord>, RepositoryError>;

    async fn find_by_job(&self, job_id: &JobId)
    -> Result<Option<GenerationRecord>, RepositoryError>;

    async fn mark_completed(
        &self,
        id: RecordId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_failed(
        &self,
        id: RecordId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_pending(&self, id: RecordId, now: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn list_for_user(&self, user_id: UserId)
    -> Result<Vec<GenerationRecord>, RepositoryError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, RepositoryError>;

    /// Delete notifications whose `expires_at` has passed; returns how many.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

/// [`JobLookup`] over a [`JobRepository`], for the executor's idempotency check.
#[derive(Clone)]
pub struct RepositoryJobLookup {
    jobs: Arc<dyn JobRepository>,
}

impl RepositoryJobLookup {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobLookup for RepositoryJobLookup {
    async fn find_job(&self, job_id: &JobId) -> Result<Option<Job>, LookupError> {
        self.jobs
            .get(job_id)
            .await
            .map_err(|e| LookupError(e.to_string()))
    }
}
