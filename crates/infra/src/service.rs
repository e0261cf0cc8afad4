//! Submission service: `submit` and `retry`.
//!
//! Credits are debited before the job is queued. Every path that fails after the
//! debit refunds it before returning, so a rejected submission never costs anything.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use clipforge_core::{JobId, RecordId, UserId};
use clipforge_generation::{
    CreditPricing, GenerationRecord, Job, JobKind, JobPayload, JobStatus, QueuedJob,
    ValidationError,
};
use clipforge_ledger::LedgerError;

use crate::Ledger;
use crate::jobs::{Broker, BrokerError, JobOptions};
use crate::repo::{JobRepository, RecordRepository, RepositoryError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("job {0} already finished")]
    IdempotencyConflict(JobId),
    #[error("job {0} is still queued or running")]
    JobActive(JobId),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("failed to enqueue job: {0}")]
    Enqueue(BrokerError),
}

impl SubmitError {
    /// Machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Invalid(_) => "invalid_request",
            SubmitError::InsufficientCredits { .. } => "insufficient_credits",
            SubmitError::IdempotencyConflict(_) => "idempotency_conflict",
            SubmitError::JobActive(_) => "job_active",
            SubmitError::NotFound(_) => "not_found",
            SubmitError::Ledger(_) => "ledger_error",
            SubmitError::Repository(_) => "storage_error",
            SubmitError::Enqueue(_) => "queue_unavailable",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SubmitError::Invalid(_)
                | SubmitError::InsufficientCredits { .. }
                | SubmitError::IdempotencyConflict(_)
                | SubmitError::JobActive(_)
                | SubmitError::NotFound(_)
        )
    }
}

impl From<LedgerError> for SubmitError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits { balance, required } => {
                SubmitError::InsufficientCredits { balance, required }
            }
            other => SubmitError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: UserId,
    /// Caller-supplied id for idempotent submission; generated when absent.
    pub job_id: Option<JobId>,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: JobId,
    pub record_id: RecordId,
    pub kind: JobKind,
    pub cost: i64,
    /// `true` when an identical in-flight submission already existed.
    pub deduplicated: bool,
}

impl Submission {
    fn for_job(job: &Job, deduplicated: bool) -> Self {
        Self {
            job_id: job.job_id.clone(),
            record_id: job.record_id,
            kind: job.kind(),
            cost: job.cost,
            deduplicated,
        }
    }
}

#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobRepository>,
    records: Arc<dyn RecordRepository>,
    ledger: Ledger,
    broker: Arc<dyn Broker>,
    pricing: CreditPricing,
    options: HashMap<JobKind, JobOptions>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        records: Arc<dyn RecordRepository>,
        ledger: Ledger,
        broker: Arc<dyn Broker>,
        pricing: CreditPricing,
    ) -> Self {
        Self {
            jobs,
            records,
            ledger,
            broker,
            pricing,
            options: HashMap::new(),
        }
    }

    pub fn with_queue_options(mut self, queue: JobKind, options: JobOptions) -> Self {
        self.options.insert(queue, options);
        self
    }

    fn options_for(&self, queue: JobKind) -> JobOptions {
        self.options.get(&queue).cloned().unwrap_or_default()
    }

    /// Existing job for an idempotent resubmission, or the conflict it causes.
    fn existing_submission(job: &Job) -> Result<Submission, SubmitError> {
        match job.status {
            JobStatus::Pending | JobStatus::Processing => Ok(Submission::for_job(job, true)),
            JobStatus::Completed | JobStatus::Failed => {
                Err(SubmitError::IdempotencyConflict(job.job_id.clone()))
            }
        }
    }

    async fn refund(&self, user_id: UserId, amount: i64, job_id: &JobId) {
        if let Err(e) = self.ledger.add_credits(user_id, amount).await {
            error!(
                %user_id,
                %job_id,
                amount,
                error = %e,
                "refund after rejected submission failed; needs manual reconciliation"
            );
        }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        let SubmitRequest {
            user_id,
            job_id,
            payload,
        } = request;
        payload.validate()?;

        let job_id = match job_id {
            Some(job_id) => {
                if let Some(existing) = self.jobs.get(&job_id).await? {
                    if existing.user_id != user_id {
                        return Err(SubmitError::IdempotencyConflict(job_id));
                    }
                    return Self::existing_submission(&existing);
                }
                job_id
            }
            None => JobId::generate(),
        };

        let cost = self.pricing.cost(&payload);
        let balance = self.ledger.deduct(user_id, cost).await?;

        let now = Utc::now();
        let job = Job::new(job_id.clone(), user_id, RecordId::new(), payload, cost, now);

        if let Err(e) = self.jobs.insert(&job).await {
            self.refund(user_id, cost, &job_id).await;
            // Lost a race with a concurrent submission of the same id.
            if let RepositoryError::Conflict(_) = e {
                if let Some(existing) = self.jobs.get(&job_id).await? {
                    return Self::existing_submission(&existing);
                }
            }
            return Err(e.into());
        }

        let record = GenerationRecord::pending(
            job.record_id,
            job_id.clone(),
            user_id,
            job.kind(),
            cost,
            now,
        );
        if let Err(e) = self.records.insert(&record).await {
            self.refund(user_id, cost, &job_id).await;
            if let Err(fail_err) = self.jobs.fail(&job_id, &e.to_string(), Utc::now()).await {
                warn!(%job_id, error = %fail_err, "failed to mark job failed after record error");
            }
            return Err(e.into());
        }

        self.enqueue(&job).await?;

        info!(%job_id, queue = %job.kind(), cost, balance, "job submitted");
        Ok(Submission::for_job(&job, false))
    }

    /// The caller's own job. Other users' jobs read as missing.
    pub async fn status(&self, user_id: UserId, job_id: &JobId) -> Result<Job, SubmitError> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.user_id == user_id => Ok(job),
            _ => Err(SubmitError::NotFound(job_id.clone())),
        }
    }

    /// Re-enqueue a failed job under the same id. The earlier failure was refunded,
    /// so the cost is debited again.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn retry(&self, user_id: UserId, job_id: &JobId) -> Result<Submission, SubmitError> {
        let job = match self.jobs.get(job_id).await? {
            Some(job) if job.user_id == user_id => job,
            _ => return Err(SubmitError::NotFound(job_id.clone())),
        };
        match job.status {
            JobStatus::Completed => return Err(SubmitError::IdempotencyConflict(job_id.clone())),
            JobStatus::Pending | JobStatus::Processing => {
                return Err(SubmitError::JobActive(job_id.clone()));
            }
            JobStatus::Failed => {}
        }

        self.ledger.deduct(user_id, job.cost).await?;

        let now = Utc::now();
        let job = match self.jobs.reset_for_retry(job_id, now).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.refund(user_id, job.cost, job_id).await;
                return Err(SubmitError::JobActive(job_id.clone()));
            }
            Err(e) => {
                self.refund(user_id, job.cost, job_id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.records.mark_pending(job.record_id, now).await {
            warn!(%job_id, error = %e, "failed to reset record to pending");
        }

        // The finished entry from the previous run would block a fresh enqueue on some brokers.
        if let Err(e) = self.broker.remove(job.kind(), job_id).await {
            warn!(%job_id, error = %e, "failed to remove previous broker entry");
        }

        self.enqueue(&job).await?;

        info!(%job_id, queue = %job.kind(), cost = job.cost, "job retried");
        Ok(Submission::for_job(&job, false))
    }

    /// Enqueue, compensating the debit if the broker rejects the entry.
    async fn enqueue(&self, job: &Job) -> Result<(), SubmitError> {
        let queue = job.kind();
        let Err(e) = self
            .broker
            .enqueue(queue, QueuedJob::from_job(job), self.options_for(queue))
            .await
        else {
            return Ok(());
        };

        warn!(job_id = %job.job_id, queue = %queue, error = %e, "enqueue failed; compensating");
        self.refund(job.user_id, job.cost, &job.job_id).await;

        let now = Utc::now();
        let reason = format!("failed to enqueue: {e}");
        if let Err(fail_err) = self.jobs.fail(&job.job_id, &reason, now).await {
            warn!(job_id = %job.job_id, error = %fail_err, "failed to mark job failed");
        }
        if let Err(rec_err) = self.records.mark_failed(job.record_id, &reason, now).await {
            warn!(job_id = %job.job_id, error = %rec_err, "failed to mark record failed");
        }
        Err(SubmitError::Enqueue(e))
    }
}
