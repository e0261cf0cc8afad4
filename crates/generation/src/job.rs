//! Job: the queued unit of work correlated to one user request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::{DomainError, DomainResult, Entity, JobId, RecordId, UserId};

use crate::output::GenerationOutput;
use crate::payload::JobPayload;

/// Job kind; one logical queue per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Story,
    Effect,
    GenerationLib,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Story, JobKind::Effect, JobKind::GenerationLib];

    /// Broker queue name.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::Story => "story-generation",
            JobKind::Effect => "effect-generation",
            JobKind::GenerationLib => "generation-lib",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Story => "story",
            JobKind::Effect => "effect",
            JobKind::GenerationLib => "generationLib",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job / record status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job record.
///
/// Status transitions are the only mutation; jobs are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub user_id: UserId,
    pub record_id: RecordId,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Credits debited for this job; a failure refunds exactly this amount.
    pub cost: i64,
    #[serde(default)]
    pub result: Option<GenerationOutput>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_id: JobId,
        user_id: UserId,
        record_id: RecordId,
        payload: JobPayload,
        cost: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            user_id,
            record_id,
            payload,
            status: JobStatus::Pending,
            cost,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// `pending → processing`. Re-delivery of an already processing job is allowed.
    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Processing;
                self.updated_at = now;
                Ok(())
            }
            other => Err(DomainError::illegal_transition(
                "start",
                format_args!("job {}", self.job_id),
                other,
            )),
        }
    }

    pub fn complete(&mut self, output: GenerationOutput, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Completed;
                self.result = Some(output);
                self.error = None;
                self.updated_at = now;
                Ok(())
            }
            other => Err(DomainError::illegal_transition(
                "complete",
                format_args!("job {}", self.job_id),
                other,
            )),
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Failed;
                self.error = Some(error.into());
                self.updated_at = now;
                Ok(())
            }
            other => Err(DomainError::illegal_transition(
                "fail",
                format_args!("job {}", self.job_id),
                other,
            )),
        }
    }

    /// `failed → pending` for a client retry. Active and completed jobs are rejected.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Failed => {
                self.status = JobStatus::Pending;
                self.error = None;
                self.updated_at = now;
                Ok(())
            }
            JobStatus::Completed => Err(DomainError::conflict(format!(
                "job {} already completed",
                self.job_id
            ))),
            JobStatus::Pending | JobStatus::Processing => Err(DomainError::conflict(format!(
                "job {} is still {}",
                self.job_id, self.status
            ))),
        }
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.job_id
    }
}

/// Data carried by a broker entry.
///
/// `restart_reconciled` is the restart marker: the Recovery Manager sets it before
/// failing the job so a late broker-level failure callback is recognised and skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub job_id: JobId,
    pub user_id: UserId,
    pub record_id: RecordId,
    pub payload: JobPayload,
    #[serde(default)]
    pub restart_reconciled: bool,
}

impl QueuedJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            user_id: job.user_id,
            record_id: job.record_id,
            payload: job.payload.clone(),
            restart_reconciled: false,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{EffectRequest, JobPayload};

    fn test_job() -> Job {
        Job::new(
            JobId::generate(),
            UserId::new(),
            RecordId::new(),
            JobPayload::Effect(EffectRequest {
                effect_id: "effects/zoom".to_string(),
                image_url: "https://cdn.example/in.png".to_string(),
                prompt: None,
            }),
            20,
            Utc::now(),
        )
    }

    #[test]
    fn job_lifecycle_to_completed() {
        let mut job = test_job();
        assert_eq!(job.status, JobStatus::Pending);

        job.start(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        job.complete(GenerationOutput::new("https://cdn.example/out.mp4"), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.is_some());
    }

    #[test]
    fn terminal_jobs_reject_further_transitions() {
        let mut job = test_job();
        job.fail("provider exploded", Utc::now()).unwrap();

        assert!(job.start(Utc::now()).is_err());
        assert!(job.fail("again", Utc::now()).is_err());
        assert!(
            job.complete(GenerationOutput::new("https://x"), Utc::now())
                .is_err()
        );
    }

    #[test]
    fn retry_only_from_failed() {
        let mut job = test_job();
        assert!(matches!(
            job.reset_for_retry(Utc::now()),
            Err(DomainError::Conflict(_))
        ));

        job.fail("boom", Utc::now()).unwrap();
        job.reset_for_retry(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());

        job.complete(GenerationOutput::new("https://x"), Utc::now())
            .unwrap();
        assert!(matches!(
            job.reset_for_retry(Utc::now()),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn queued_job_carries_tagged_payload_and_marker() {
        let job = test_job();
        let queued = QueuedJob::from_job(&job);
        let json = serde_json::to_value(&queued).unwrap();
        assert_eq!(json["payload"]["kind"], "effect");
        assert_eq!(json["restartReconciled"], false);

        let back: QueuedJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, queued);
        assert_eq!(back.kind(), JobKind::Effect);
    }

    #[test]
    fn kinds_map_to_distinct_queues() {
        let names: std::collections::HashSet<_> =
            JobKind::ALL.iter().map(|k| k.queue_name()).collect();
        assert_eq!(names.len(), 3);
    }
}
