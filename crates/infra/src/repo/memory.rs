//! In-memory repositories for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use clipforge_core::{JobId, RecordId, UserId};
use clipforge_events::Notification;
use clipforge_generation::{GenerationOutput, GenerationRecord, Job, JobStatus};

use super::{JobRepository, NotificationStore, RecordRepository, RepositoryError};

fn poisoned(what: &str) -> RepositoryError {
    RepositoryError::Storage(format!("{what} lock poisoned"))
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    fail_writes: bool,
}

/// Map-backed job repository. `fail_writes` makes every mutation fail, as a
/// database outage would.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    inner: Mutex<JobTable>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Overwrite a job as-is (test setup for states the service never produces).
    pub fn put(&self, job: Job) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.jobs.insert(job.job_id.clone(), job);
        }
    }

    fn read(&self) -> Result<MutexGuard<'_, JobTable>, RepositoryError> {
        self.inner.lock().map_err(|_| poisoned("job table"))
    }

    fn write(&self) -> Result<MutexGuard<'_, JobTable>, RepositoryError> {
        let inner = self.read()?;
        if inner.fail_writes {
            return Err(RepositoryError::Storage("job table unavailable".to_string()));
        }
        Ok(inner)
    }

    /// Apply a domain transition; a rejected transition means "did not apply".
    fn transition<F>(&self, job_id: &JobId, apply: F) -> Result<Option<Job>, RepositoryError>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Err(RepositoryError::NotFound(format!("job {job_id}")));
        };
        let mut candidate = job.clone();
        if !apply(&mut candidate) {
            return Ok(None);
        }
        *job = candidate.clone();
        Ok(Some(candidate))
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.job_id) {
            return Err(RepositoryError::Conflict(format!("job {} exists", job.job_id)));
        }
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(self.read()?.jobs.get(job_id).cloned())
    }

    async fn mark_processing(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let applied = self.transition(job_id, |job| {
            job.status == JobStatus::Pending && job.start(now).is_ok()
        })?;
        Ok(applied.is_some())
    }

    async fn complete(
        &self,
        job_id: &JobId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        self.transition(job_id, |job| job.complete(output.clone(), now).is_ok())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        self.transition(job_id, |job| job.fail(error, now).is_ok())
    }

    async fn reset_for_retry(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        self.transition(job_id, |job| job.reset_for_retry(now).is_ok())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// Map-backed record repository keyed by record id, so concurrent updates to two
/// records of the same user never touch the same entry.
#[derive(Debug, Default)]
pub struct InMemoryRecordRepository {
    records: Mutex<HashMap<RecordId, GenerationRecord>>,
}

impl InMemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RecordId, GenerationRecord>>, RepositoryError> {
        self.records.lock().map_err(|_| poisoned("record table"))
    }

    fn update<F>(&self, id: RecordId, apply: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut GenerationRecord),
    {
        let mut records = self.lock()?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("record {id}")))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl RecordRepository for InMemoryRecordRepository {
    async fn insert(&self, record: &GenerationRecord) -> Result<(), RepositoryError> {
        let mut records = self.lock()?;
        if records.contains_key(&record.id) {
            return Err(RepositoryError::Conflict(format!("record {} exists", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<GenerationRecord>, RepositoryError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_job(
        &self,
        job_id: &JobId,
    ) -> Result<Option<GenerationRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .values()
            .find(|r| &r.job_id == job_id)
            .cloned())
    }

    async fn mark_completed(
        &self,
        id: RecordId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.update(id, |r| r.mark_completed(output, now))
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.update(id, |r| r.mark_failed(error, now))
    }

    async fn mark_pending(&self, id: RecordId, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update(id, |r| r.mark_pending(now))
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<GenerationRecord>, RepositoryError> {
        let mut records: Vec<GenerationRecord> = self
            .lock()?
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[derive(Debug, Default)]
struct NotificationTable {
    rows: Vec<Notification>,
    fail_writes: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    inner: Mutex<NotificationTable>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, NotificationTable>, RepositoryError> {
        self.inner.lock().map_err(|_| poisoned("notification table"))
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(RepositoryError::Storage(
                "notification table unavailable".to_string(),
            ));
        }
        inner.rows.push(notification.clone());
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, RepositoryError> {
        let inner = self.lock()?;
        let mut rows: Vec<Notification> = inner
            .rows
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut inner = self.lock()?;
        let before = inner.rows.len();
        inner.rows.retain(|n| !n.is_expired(now));
        Ok((before - inner.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipforge_events::{NotificationCategory, NotificationEvent};
    use clipforge_generation::{EffectRequest, JobPayload};

    fn job() -> Job {
        Job::new(
            JobId::generate(),
            UserId::new(),
            RecordId::new(),
            JobPayload::Effect(EffectRequest {
                effect_id: "effects/zoom".to_string(),
                image_url: "https://img.test/a.png".to_string(),
                prompt: None,
            }),
            20,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn fail_applies_only_once() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();

        let first = repo.fail(&job.job_id, "provider_error: boom", Utc::now()).await.unwrap();
        assert_eq!(first.map(|j| j.status), Some(JobStatus::Failed));

        let second = repo.fail(&job.job_id, "provider_error: boom", Utc::now()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn completed_job_cannot_fail_or_complete_again() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();
        assert!(repo.mark_processing(&job.job_id, Utc::now()).await.unwrap());

        let output = GenerationOutput::new("https://cdn.test/a.mp4");
        assert!(repo.complete(&job.job_id, &output, Utc::now()).await.unwrap().is_some());
        assert!(repo.complete(&job.job_id, &output, Utc::now()).await.unwrap().is_none());
        assert!(repo.fail(&job.job_id, "late", Utc::now()).await.unwrap().is_none());
        assert!(!repo.mark_processing(&job.job_id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();
        assert!(matches!(
            repo.insert(&job).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn write_outage_surfaces_as_storage_error() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();
        repo.fail_writes(true);

        let err = repo
            .complete(&job.job_id, &GenerationOutput::new("https://x"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert!(repo.get(&job.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_notifications_are_swept() {
        let store = InMemoryNotificationStore::new();
        let user = UserId::new();
        let event = NotificationEvent::new("system.welcome", NotificationCategory::System);
        let old = Notification::from_event(
            user,
            &event,
            "t",
            "m",
            Utc::now() - chrono::Duration::days(8),
            chrono::Duration::days(7),
        );
        let fresh = Notification::from_event(user, &event, "t", "m", Utc::now(), chrono::Duration::days(7));
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        assert_eq!(store.delete_expired(Utc::now()).await.unwrap(), 1);
        let left = store.list_for_user(user).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }
}
