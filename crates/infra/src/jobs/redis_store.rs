//! Redis-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! Per queue, under `{prefix}:{queue}`:
//! - `job:{id}`: hash with `body` (JSON [`BrokerJob`]) and `state`
//! - `pending`: list of waiting ids (RPUSH / LPOP)
//! - `delayed`: sorted set scored by redelivery time (ms)
//! - `active`: sorted set scored by last heartbeat (ms)
//! - `completed`, `failed`: lists, newest first, trimmed to the retention limits
//!
//! Moving an id between `pending`, `delayed` and `active` always rewrites the hash
//! `state` in the same Lua script, so membership and `state` never disagree. Reads
//! trust `state` over the serialized body, and listings trust membership.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{debug, instrument, warn};

use clipforge_core::JobId;
use clipforge_generation::{JobKind, QueuedJob};

use super::store::{Broker, BrokerError};
use super::types::{BrokerJob, BrokerState, FailOutcome, JobOptions, QueueCounts};

const DEFAULT_PREFIX: &str = "clipforge";

/// KEYS: pending, active. ARGV: now (ms), job key prefix.
/// Ids whose hash is gone are dropped on the way.
static RESERVE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        while true do
            local id = redis.call('LPOP', KEYS[1])
            if not id then
                return false
            end
            local job = ARGV[2] .. id
            if redis.call('HEXISTS', job, 'body') == 1 then
                redis.call('ZADD', KEYS[2], ARGV[1], id)
                redis.call('HSET', job, 'state', 'active')
                return id
            end
        end
        ",
    )
});

/// KEYS: delayed, pending. ARGV: now (ms), job key prefix.
static PROMOTE_DELAYED: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[1], id)
            local job = ARGV[2] .. id
            if redis.call('HEXISTS', job, 'body') == 1 then
                redis.call('RPUSH', KEYS[2], id)
                redis.call('HSET', job, 'state', 'waiting')
            end
        end
        return #due
        ",
    )
});

/// KEYS: active, pending, job. ARGV: id, cutoff (ms, exclusive), body, state.
/// Returns 0 when the entry heartbeated or was claimed since it was listed.
static REQUEUE_STALLED: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local seen = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if not seen or tonumber(seen) >= tonumber(ARGV[2]) then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HSET', KEYS[3], 'body', ARGV[3], 'state', ARGV[4])
        redis.call('RPUSH', KEYS[2], ARGV[1])
        return 1
        ",
    )
});

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            BrokerError::Unavailable(e.to_string())
        } else {
            BrokerError::Command(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: Arc<str>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisBroker {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()).into(),
        })
    }

    fn key(&self, queue: JobKind, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue.queue_name(), suffix)
    }

    fn job_key(&self, queue: JobKind, id: &JobId) -> String {
        self.key(queue, &format!("job:{id}"))
    }

    async fn load(&self, queue: JobKind, id: &JobId) -> Result<Option<BrokerJob>, BrokerError> {
        let mut conn = self.conn.clone();
        let (body, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.job_key(queue, id))
            .arg("body")
            .arg("state")
            .query_async(&mut conn)
            .await?;
        let Some(raw) = body else {
            return Ok(None);
        };
        let mut job: BrokerJob =
            serde_json::from_str(&raw).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        if let Some(state) = state.as_deref().and_then(BrokerState::parse) {
            job.state = state;
        }
        Ok(Some(job))
    }

    async fn load_required(&self, queue: JobKind, id: &JobId) -> Result<BrokerJob, BrokerError> {
        self.load(queue, id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(id.clone()))
    }

    fn write_job(&self, pipe: &mut redis::Pipeline, job: &BrokerJob) -> Result<(), BrokerError> {
        let body =
            serde_json::to_string(job).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        pipe.cmd("HSET")
            .arg(self.job_key(job.queue, &job.id))
            .arg("body")
            .arg(body)
            .arg("state")
            .arg(job.state.as_str())
            .ignore();
        Ok(())
    }

    /// LPUSH onto a finished list and drop whatever falls past `keep`.
    async fn push_finished(
        &self,
        queue: JobKind,
        state: BrokerState,
        id: &JobId,
        keep: usize,
    ) -> Result<(), BrokerError> {
        let list = self.key(queue, state.as_str());
        let mut conn = self.conn.clone();
        let overflow: Vec<String> = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&list)
            .arg(id.as_str())
            .ignore()
            .cmd("LRANGE")
            .arg(&list)
            .arg(keep)
            .arg(-1)
            .cmd("LTRIM")
            .arg(&list)
            .arg(0)
            .arg(keep as i64 - 1)
            .ignore()
            .query_async::<_, (Vec<String>,)>(&mut conn)
            .await
            .map(|(overflow,)| overflow)?;

        for stale in overflow {
            let Ok(stale_id) = JobId::parse(stale) else {
                continue;
            };
            let _: i64 = redis::cmd("DEL")
                .arg(self.job_key(queue, &stale_id))
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn promote_delayed(&self, queue: JobKind) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let promoted: i64 = PROMOTE_DELAYED
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "pending"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.key(queue, "job:"))
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(queue = %queue, promoted, "delayed entries due");
        }
        Ok(())
    }

    async fn ids_for(&self, queue: JobKind, state: BrokerState) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let ids = match state {
            BrokerState::Waiting => {
                redis::cmd("LRANGE")
                    .arg(self.key(queue, "pending"))
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
            BrokerState::Active | BrokerState::Delayed => {
                redis::cmd("ZRANGE")
                    .arg(self.key(queue, state.as_str()))
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
            BrokerState::Completed | BrokerState::Failed => {
                redis::cmd("LRANGE")
                    .arg(self.key(queue, state.as_str()))
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
        };
        Ok(ids)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, data, options), fields(queue = %queue, job_id = %data.job_id), err)]
    async fn enqueue(
        &self,
        queue: JobKind,
        data: QueuedJob,
        options: JobOptions,
    ) -> Result<BrokerJob, BrokerError> {
        let id = data.job_id.clone();
        if let Some(existing) = self.load(queue, &id).await? {
            if !existing.state.is_finished() {
                return Err(BrokerError::AlreadyExists(id));
            }
            self.remove(queue, &id).await?;
        }

        let job = BrokerJob::new(queue, data, options, Utc::now());
        let body =
            serde_json::to_string(&job).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let created: i64 = redis::cmd("HSETNX")
            .arg(self.job_key(queue, &id))
            .arg("body")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        if created == 0 {
            return Err(BrokerError::AlreadyExists(id));
        }

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(queue, &id))
            .arg("state")
            .arg(job.state.as_str())
            .ignore()
            .cmd("RPUSH")
            .arg(self.key(queue, "pending"))
            .arg(id.as_str())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(job)
    }

    async fn reserve(&self, queue: JobKind) -> Result<Option<BrokerJob>, BrokerError> {
        self.promote_delayed(queue).await?;

        let mut conn = self.conn.clone();
        loop {
            // Pop and claim in one step; a crash afterwards leaves the id in `active`
            // for the stall sweep rather than in no set at all.
            let now = Utc::now();
            let claimed: Option<String> = RESERVE
                .key(self.key(queue, "pending"))
                .key(self.key(queue, "active"))
                .arg(now.timestamp_millis())
                .arg(self.key(queue, "job:"))
                .invoke_async(&mut conn)
                .await?;
            let Some(raw) = claimed else {
                return Ok(None);
            };
            let Ok(id) = JobId::parse(raw.clone()) else {
                warn!(queue = %queue, raw = %raw, "dropping malformed id from active set");
                let _: i64 = redis::cmd("ZREM")
                    .arg(self.key(queue, "active"))
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                continue;
            };
            // Removed between the claim and the read.
            let Some(mut job) = self.load(queue, &id).await? else {
                continue;
            };

            job.mark_active(now);
            let mut pipe = redis::pipe();
            self.write_job(&mut pipe, &job)?;
            pipe.query_async::<_, ()>(&mut conn).await?;
            return Ok(Some(job));
        }
    }

    async fn heartbeat(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        let mut job = self.load_required(queue, id).await?;
        if job.state != BrokerState::Active {
            return Ok(());
        }
        let now = Utc::now();
        job.heartbeat_at = Some(now);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.write_job(&mut pipe, &job)?;
        pipe.cmd("ZADD")
            .arg(self.key(queue, "active"))
            .arg(now.timestamp_millis())
            .arg(id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn complete(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        let mut job = self.load_required(queue, id).await?;
        job.mark_completed(Utc::now());

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.write_job(&mut pipe, &job)?;
        pipe.cmd("ZREM")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.push_finished(queue, BrokerState::Completed, id, job.options.keep_completed)
            .await
    }

    #[instrument(skip(self, reason), fields(queue = %queue, job_id = %id), err)]
    async fn fail(
        &self,
        queue: JobKind,
        id: &JobId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailOutcome, BrokerError> {
        let mut job = self.load_required(queue, id).await?;
        let outcome = job.mark_failed(reason, retryable, Utc::now());

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.write_job(&mut pipe, &job)?;
        pipe.cmd("ZREM")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .ignore();
        if let (FailOutcome::Retrying { .. }, Some(at)) = (outcome, job.available_at) {
            pipe.cmd("ZADD")
                .arg(self.key(queue, "delayed"))
                .arg(at.timestamp_millis())
                .arg(id.as_str())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        if let FailOutcome::Failed { .. } = outcome {
            self.push_finished(queue, BrokerState::Failed, id, job.options.keep_failed)
                .await?;
        }
        Ok(outcome)
    }

    async fn get(&self, queue: JobKind, id: &JobId) -> Result<Option<BrokerJob>, BrokerError> {
        self.load(queue, id).await
    }

    async fn jobs_in_states(
        &self,
        queue: JobKind,
        states: &[BrokerState],
    ) -> Result<Vec<BrokerJob>, BrokerError> {
        // Membership decides the state; a hash alone does not make an entry live.
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for state in states {
            for raw in self.ids_for(queue, *state).await? {
                let Ok(id) = JobId::parse(raw) else {
                    continue;
                };
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(mut job) = self.load(queue, &id).await? {
                    job.state = *state;
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by_key(|j| j.enqueued_at);
        Ok(jobs)
    }

    async fn update_data(
        &self,
        queue: JobKind,
        id: &JobId,
        data: QueuedJob,
    ) -> Result<(), BrokerError> {
        let mut job = self.load_required(queue, id).await?;
        job.data = data;
        job.updated_at = Utc::now();

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        self.write_job(&mut pipe, &job)?;
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn remove(&self, queue: JobKind, id: &JobId) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.job_key(queue, id))
            .cmd("LREM")
            .arg(self.key(queue, "pending"))
            .arg(0)
            .arg(id.as_str())
            .ignore()
            .cmd("ZREM")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .ignore()
            .cmd("ZREM")
            .arg(self.key(queue, "delayed"))
            .arg(id.as_str())
            .ignore()
            .cmd("LREM")
            .arg(self.key(queue, "completed"))
            .arg(0)
            .arg(id.as_str())
            .ignore()
            .cmd("LREM")
            .arg(self.key(queue, "failed"))
            .arg(0)
            .arg(id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!(removed = deleted > 0, "broker entry removed");
        Ok(deleted > 0)
    }

    async fn counts(&self, queue: JobKind) -> Result<QueueCounts, BrokerError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.key(queue, "pending"))
                .cmd("ZCARD")
                .arg(self.key(queue, "active"))
                .cmd("ZCARD")
                .arg(self.key(queue, "delayed"))
                .cmd("LLEN")
                .arg(self.key(queue, "completed"))
                .cmd("LLEN")
                .arg(self.key(queue, "failed"))
                .query_async(&mut conn)
                .await?;
        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn requeue_stalled(
        &self,
        queue: JobKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BrokerError> {
        let mut conn = self.conn.clone();
        let active = self.key(queue, "active");
        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&active)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async(&mut conn)
            .await?;

        let mut requeued = Vec::new();
        for raw in candidates {
            let Ok(id) = JobId::parse(raw) else {
                continue;
            };
            let Some(mut job) = self.load(queue, &id).await? else {
                continue;
            };
            if job.data.restart_reconciled {
                continue;
            }

            job.mark_stalled(Utc::now());
            let body = serde_json::to_string(&job)
                .map_err(|e| BrokerError::Serialization(e.to_string()))?;
            let moved: i64 = REQUEUE_STALLED
                .key(&active)
                .key(self.key(queue, "pending"))
                .key(self.job_key(queue, &id))
                .arg(id.as_str())
                .arg(cutoff.timestamp_millis())
                .arg(body)
                .arg(job.state.as_str())
                .invoke_async(&mut conn)
                .await?;
            if moved == 1 {
                requeued.push(id);
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use clipforge_core::{RecordId, UserId};
    use clipforge_generation::{EffectRequest, JobPayload};

    const TEST_REDIS_URL: &str = "CLIPFORGE_TEST_REDIS_URL";

    /// A broker on a throwaway prefix, or `None` when no test server is configured.
    async fn broker() -> Option<RedisBroker> {
        let url = std::env::var(TEST_REDIS_URL).ok()?;
        let prefix = format!("clipforge-test-{}", JobId::generate());
        Some(RedisBroker::connect(url, Some(prefix)).await.unwrap())
    }

    fn queued() -> QueuedJob {
        QueuedJob {
            job_id: JobId::generate(),
            user_id: UserId::new(),
            record_id: RecordId::new(),
            payload: JobPayload::Effect(EffectRequest {
                effect_id: "effects/zoom".to_string(),
                image_url: "https://img.test/a.png".to_string(),
                prompt: None,
            }),
            restart_reconciled: false,
        }
    }

    #[tokio::test]
    async fn reserve_claims_into_active_with_matching_state() {
        let Some(broker) = broker().await else { return };
        let data = queued();
        let id = data.job_id.clone();
        broker
            .enqueue(JobKind::Effect, data, JobOptions::default())
            .await
            .unwrap();

        let reserved = broker.reserve(JobKind::Effect).await.unwrap().unwrap();

        assert_eq!(reserved.id, id);
        let counts = broker.counts(JobKind::Effect).await.unwrap();
        assert_eq!((counts.waiting, counts.active), (0, 1));
        let stored = broker.get(JobKind::Effect, &id).await.unwrap().unwrap();
        assert_eq!(stored.state, BrokerState::Active);
        assert!(broker.reserve(JobKind::Effect).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_entry_is_requeued_exactly_once() {
        let Some(broker) = broker().await else { return };
        let data = queued();
        let id = data.job_id.clone();
        broker
            .enqueue(JobKind::Effect, data, JobOptions::default())
            .await
            .unwrap();
        broker.reserve(JobKind::Effect).await.unwrap().unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let first = broker.requeue_stalled(JobKind::Effect, cutoff).await.unwrap();
        let second = broker.requeue_stalled(JobKind::Effect, cutoff).await.unwrap();

        assert_eq!(first, vec![id.clone()]);
        assert!(second.is_empty());
        let counts = broker.counts(JobKind::Effect).await.unwrap();
        assert_eq!((counts.waiting, counts.active), (1, 0));
        let stored = broker.get(JobKind::Effect, &id).await.unwrap().unwrap();
        assert_eq!(stored.state, BrokerState::Waiting);
    }

    #[tokio::test]
    async fn listings_follow_queue_membership() {
        let Some(broker) = broker().await else { return };
        let data = queued();
        let id = data.job_id.clone();
        broker
            .enqueue(JobKind::Effect, data, JobOptions::default())
            .await
            .unwrap();

        // The id leaves `pending` without reaching any other set.
        let mut conn = broker.conn.clone();
        let _: Option<String> = redis::cmd("LPOP")
            .arg(broker.key(JobKind::Effect, "pending"))
            .query_async(&mut conn)
            .await
            .unwrap();

        let live = broker
            .jobs_in_states(
                JobKind::Effect,
                &[BrokerState::Waiting, BrokerState::Active, BrokerState::Delayed],
            )
            .await
            .unwrap();
        assert!(live.is_empty());
        assert!(broker.get(JobKind::Effect, &id).await.unwrap().is_some());
    }
}
