//! Request/response bodies and their mapping to domain types.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::{JobId, RecordId, UserId};
use clipforge_generation::{GenerationOutput, Job, JobKind, JobPayload, JobStatus};
use clipforge_infra::service::SubmitRequest;

use crate::app::errors::json_error;

/// `POST /jobs` body: `{ "jobId"?, "kind", "payload" }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobBody {
    #[serde(default)]
    pub job_id: Option<String>,
    pub kind: JobKind,
    pub payload: serde_json::Value,
}

impl SubmitJobBody {
    pub fn into_request(self, user_id: UserId) -> Result<SubmitRequest, axum::response::Response> {
        let job_id = self.job_id.map(parse_job_id).transpose()?;

        let payload = match self.kind {
            JobKind::Story => serde_json::from_value(self.payload).map(JobPayload::Story),
            JobKind::Effect => serde_json::from_value(self.payload).map(JobPayload::Effect),
            JobKind::GenerationLib => {
                serde_json::from_value(self.payload).map(JobPayload::GenerationLib)
            }
        }
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string()))?;

        Ok(SubmitRequest {
            user_id,
            job_id,
            payload,
        })
    }
}

pub fn parse_job_id(raw: String) -> Result<JobId, axum::response::Response> {
    JobId::parse(raw)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()))
}

/// Client-facing view of a job; the payload stays server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub record_id: RecordId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub cost: i64,
    pub result: Option<GenerationOutput>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            kind: job.kind(),
            job_id: job.job_id,
            record_id: job.record_id,
            status: job.status,
            cost: job.cost,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
