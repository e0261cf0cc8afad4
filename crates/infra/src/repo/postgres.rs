//! Postgres-backed repositories and credit store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | RowNotFound | N/A | `NotFound` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | Any other | `Storage` |
//!
//! Job transitions are single `UPDATE ... WHERE status IN (...) RETURNING` statements,
//! so two concurrent failure paths for one job cannot both observe "applied".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use clipforge_core::{JobId, NotificationId, RecordId, UserId};
use clipforge_events::{Notification, NotificationCategory};
use clipforge_generation::{
    GenerationOutput, GenerationRecord, Job, JobKind, JobPayload, JobStatus,
};
use clipforge_ledger::{CreditStore, DebitOutcome, LedgerError};

use super::{JobRepository, NotificationStore, RecordRepository, RepositoryError};
use crate::notifications::{NotificationError, UserDirectory, UserProfile};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const JOB_COLUMNS: &str =
    "job_id, user_id, record_id, payload, status, cost, result, error, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, job_id, user_id, kind, status, result_url, thumbnail, title, \
     error, is_favorite, duration_secs, credits, created_at, updated_at";

/// Apply the schema (idempotent).
pub async fn migrate(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

fn map_sqlx_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::RowNotFound => RepositoryError::NotFound(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            RepositoryError::Serialization(e.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Storage(e.to_string()),
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, RepositoryError> {
    JobStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown job status {raw:?}")))
}

fn parse_kind(raw: &str) -> Result<JobKind, RepositoryError> {
    JobKind::ALL
        .into_iter()
        .find(|k| k.as_str() == raw)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown job kind {raw:?}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, RepositoryError> {
    let job_id: String = row.try_get("job_id").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    let payload: Json<JobPayload> = row.try_get("payload").map_err(map_sqlx_error)?;
    let result: Option<Json<GenerationOutput>> = row.try_get("result").map_err(map_sqlx_error)?;

    Ok(Job {
        job_id: JobId::parse(job_id).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(map_sqlx_error)?),
        record_id: RecordId::from_uuid(row.try_get("record_id").map_err(map_sqlx_error)?),
        payload: payload.0,
        status: parse_status(&status)?,
        cost: row.try_get("cost").map_err(map_sqlx_error)?,
        result: result.map(|r| r.0),
        error: row.try_get("error").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn record_from_row(row: &PgRow) -> Result<GenerationRecord, RepositoryError> {
    let job_id: String = row.try_get("job_id").map_err(map_sqlx_error)?;
    let kind: String = row.try_get("kind").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;

    Ok(GenerationRecord {
        id: RecordId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        job_id: JobId::parse(job_id).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(map_sqlx_error)?),
        kind: parse_kind(&kind)?,
        status: parse_status(&status)?,
        result_url: row.try_get("result_url").map_err(map_sqlx_error)?,
        thumbnail: row.try_get("thumbnail").map_err(map_sqlx_error)?,
        title: row.try_get("title").map_err(map_sqlx_error)?,
        error: row.try_get("error").map_err(map_sqlx_error)?,
        is_favorite: row.try_get("is_favorite").map_err(map_sqlx_error)?,
        duration_secs: row.try_get("duration_secs").map_err(map_sqlx_error)?,
        credits: row.try_get("credits").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, RepositoryError> {
    let category: String = row.try_get("category").map_err(map_sqlx_error)?;
    let data: Json<serde_json::Value> = row.try_get("data").map_err(map_sqlx_error)?;

    Ok(Notification {
        id: NotificationId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(map_sqlx_error)?),
        title: row.try_get("title").map_err(map_sqlx_error)?,
        message: row.try_get("message").map_err(map_sqlx_error)?,
        data: data.0,
        redirect_to: row.try_get("redirect_to").map_err(map_sqlx_error)?,
        category: NotificationCategory::parse(&category).ok_or_else(|| {
            RepositoryError::Serialization(format!("unknown category {category:?}"))
        })?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx_error)?,
        is_read: row.try_get("is_read").map_err(map_sqlx_error)?,
    })
}

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: Arc<PgPool>,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_transition(
        &self,
        sql: &str,
        job_id: &JobId,
        bind_extra: Option<&str>,
        result: Option<&GenerationOutput>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut query = sqlx::query(sql).bind(job_id.as_str()).bind(now);
        if let Some(extra) = bind_extra {
            query = query.bind(extra);
        }
        if let Some(output) = result {
            query = query.bind(Json(output));
        }
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, user_id, record_id, kind, payload, status, cost, result, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.job_id.as_str())
        .bind(job.user_id.as_uuid())
        .bind(job.record_id.as_uuid())
        .bind(job.kind().as_str())
        .bind(Json(&job.payload))
        .bind(job.status.as_str())
        .bind(job.cost)
        .bind(job.result.as_ref().map(Json))
        .bind(job.error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_processing(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET status = 'processing', updated_at = $2
            WHERE job_id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, output), fields(job_id = %job_id), err)]
    async fn complete(
        &self,
        job_id: &JobId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let sql = format!(
            "UPDATE jobs SET status = 'completed', result = $3, error = NULL, updated_at = $2 \
             WHERE job_id = $1 AND status IN ('pending', 'processing') RETURNING {JOB_COLUMNS}"
        );
        self.fetch_transition(&sql, job_id, None, Some(output), now).await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn fail(
        &self,
        job_id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let sql = format!(
            "UPDATE jobs SET status = 'failed', error = $3, updated_at = $2 \
             WHERE job_id = $1 AND status IN ('pending', 'processing') RETURNING {JOB_COLUMNS}"
        );
        self.fetch_transition(&sql, job_id, Some(error), None, now).await
    }

    async fn reset_for_retry(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let sql = format!(
            "UPDATE jobs SET status = 'pending', error = NULL, updated_at = $2 \
             WHERE job_id = $1 AND status = 'failed' RETURNING {JOB_COLUMNS}"
        );
        self.fetch_transition(&sql, job_id, None, None, now).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(job_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordRepository {
    pool: Arc<PgPool>,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn expect_one(id: RecordId, rows: u64) -> Result<(), RepositoryError> {
        if rows == 0 {
            return Err(RepositoryError::NotFound(format!("record {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn insert(&self, record: &GenerationRecord) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO generation_records ({RECORD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.job_id.as_str())
        .bind(record.user_id.as_uuid())
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.result_url.as_deref())
        .bind(record.thumbnail.as_deref())
        .bind(record.title.as_deref())
        .bind(record.error.as_deref())
        .bind(record.is_favorite)
        .bind(record.duration_secs)
        .bind(record.credits)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<GenerationRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM generation_records WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_job(
        &self,
        job_id: &JobId,
    ) -> Result<Option<GenerationRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM generation_records WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn mark_completed(
        &self,
        id: RecordId,
        output: &GenerationOutput,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let done = sqlx::query(
            r#"
            UPDATE generation_records
            SET status = 'completed', result_url = $2, thumbnail = $3, title = $4,
                duration_secs = $5, error = NULL, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&output.result_url)
        .bind(output.thumbnail.as_deref())
        .bind(output.title.as_deref())
        .bind(output.duration_secs)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::expect_one(id, done.rows_affected())
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let done = sqlx::query(
            r#"
            UPDATE generation_records
            SET status = 'failed', result_url = NULL, thumbnail = NULL, error = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::expect_one(id, done.rows_affected())
    }

    async fn mark_pending(&self, id: RecordId, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let done = sqlx::query(
            "UPDATE generation_records SET status = 'pending', error = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::expect_one(id, done.rows_affected())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<GenerationRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM generation_records WHERE user_id = $1 ORDER BY created_at ASC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(record_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: Arc<PgPool>,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, title, message, data, redirect_to, category,
                created_at, expires_at, is_read
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(notification.id.as_uuid())
        .bind(notification.user_id.as_uuid())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(Json(&notification.data))
        .bind(notification.redirect_to.as_deref())
        .bind(notification.category.as_str())
        .bind(notification.created_at)
        .bind(notification.expires_at)
        .bind(notification.is_read)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, message, data, redirect_to, category,
                   created_at, expires_at, is_read
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let done = sqlx::query("DELETE FROM notifications WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }
}

/// Balances live on `users.credits`; debits are a single guarded `UPDATE`.
#[derive(Debug, Clone)]
pub struct PgCreditStore {
    pool: Arc<PgPool>,
}

impl PgCreditStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn ledger_storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait]
impl CreditStore for PgCreditStore {
    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT credits FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(ledger_storage)?;
        balance.ok_or(LedgerError::UnknownUser(user_id))
    }

    async fn try_debit(&self, user_id: UserId, amount: i64) -> Result<DebitOutcome, LedgerError> {
        let debited: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET credits = credits - $2 WHERE id = $1 AND credits >= $2 RETURNING credits",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&*self.pool)
        .await
        .map_err(ledger_storage)?;

        match debited {
            Some(balance) => Ok(DebitOutcome::Debited { balance }),
            None => Ok(DebitOutcome::Insufficient {
                balance: self.balance(user_id).await?,
            }),
        }
    }

    async fn credit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&*self.pool)
        .await
        .map_err(ledger_storage)?;
        balance.ok_or(LedgerError::UnknownUser(user_id))
    }
}

#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: Arc<PgPool>,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, NotificationError> {
        let row = sqlx::query("SELECT language, device_token FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| NotificationError::Directory(e.to_string()))?;

        row.map(|row| {
            Ok(UserProfile {
                language: row
                    .try_get("language")
                    .map_err(|e| NotificationError::Directory(e.to_string()))?,
                device_token: row
                    .try_get("device_token")
                    .map_err(|e| NotificationError::Directory(e.to_string()))?,
            })
        })
        .transpose()
    }
}
