//! Broker port and in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use clipforge_core::JobId;
use clipforge_generation::{JobKind, QueuedJob};

use super::types::{BrokerJob, BrokerState, FailOutcome, JobOptions, QueueCounts};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("job already queued: {0}")]
    AlreadyExists(JobId),
    #[error("job not found in broker: {0}")]
    NotFound(JobId),
    #[error("broker serialization error: {0}")]
    Serialization(String),
    #[error("broker command error: {0}")]
    Command(String),
}

/// Durable job broker with one logical queue per [`JobKind`].
///
/// Delivery is at-least-once: an entry reserved by a worker that stops heartbeating
/// is handed out again by [`Broker::requeue_stalled`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add an entry keyed by `data.job_id`. A live entry with the same id is rejected;
    /// a finished one is replaced.
    async fn enqueue(
        &self,
        queue: JobKind,
        data: QueuedJob,
        options: JobOptions,
    ) -> Result<BrokerJob, BrokerError>;

    /// Claim the oldest ready entry, marking it active.
    async fn reserve(&self, queue: JobKind) -> Result<Option<BrokerJob>, BrokerError>;

    async fn heartbeat(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError>;

    async fn complete(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError>;

    async fn fail(
        &self,
        queue: JobKind,
        id: &JobId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailOutcome, BrokerError>;

    async fn get(&self, queue: JobKind, id: &JobId) -> Result<Option<BrokerJob>, BrokerError>;

    /// Entries in any of `states`, oldest first.
    async fn jobs_in_states(
        &self,
        queue: JobKind,
        states: &[BrokerState],
    ) -> Result<Vec<BrokerJob>, BrokerError>;

    /// Replace the entry's data (used to set the restart marker).
    async fn update_data(
        &self,
        queue: JobKind,
        id: &JobId,
        data: QueuedJob,
    ) -> Result<(), BrokerError>;

    /// Returns whether an entry was removed.
    async fn remove(&self, queue: JobKind, id: &JobId) -> Result<bool, BrokerError>;

    async fn counts(&self, queue: JobKind) -> Result<QueueCounts, BrokerError>;

    /// Move active entries whose heartbeat is older than `cutoff` back to waiting.
    /// Entries carrying the restart marker are left alone.
    async fn requeue_stalled(
        &self,
        queue: JobKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn enqueue(
        &self,
        queue: JobKind,
        data: QueuedJob,
        options: JobOptions,
    ) -> Result<BrokerJob, BrokerError> {
        (**self).enqueue(queue, data, options).await
    }

    async fn reserve(&self, queue: JobKind) -> Result<Option<BrokerJob>, BrokerError> {
        (**self).reserve(queue).await
    }

    async fn heartbeat(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        (**self).heartbeat(queue, id).await
    }

    async fn complete(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        (**self).complete(queue, id).await
    }

    async fn fail(
        &self,
        queue: JobKind,
        id: &JobId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailOutcome, BrokerError> {
        (**self).fail(queue, id, reason, retryable).await
    }

    async fn get(&self, queue: JobKind, id: &JobId) -> Result<Option<BrokerJob>, BrokerError> {
        (**self).get(queue, id).await
    }

    async fn jobs_in_states(
        &self,
        queue: JobKind,
        states: &[BrokerState],
    ) -> Result<Vec<BrokerJob>, BrokerError> {
        (**self).jobs_in_states(queue, states).await
    }

    async fn update_data(
        &self,
        queue: JobKind,
        id: &JobId,
        data: QueuedJob,
    ) -> Result<(), BrokerError> {
        (**self).update_data(queue, id, data).await
    }

    async fn remove(&self, queue: JobKind, id: &JobId) -> Result<bool, BrokerError> {
        (**self).remove(queue, id).await
    }

    async fn counts(&self, queue: JobKind) -> Result<QueueCounts, BrokerError> {
        (**self).counts(queue).await
    }

    async fn requeue_stalled(
        &self,
        queue: JobKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BrokerError> {
        (**self).requeue_stalled(queue, cutoff).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, BrokerJob>,
    /// Waiting and delayed ids in arrival order.
    pending: VecDeque<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl QueueState {
    fn trim(&mut self, state: BrokerState, keep: usize) {
        let list = match state {
            BrokerState::Completed => &mut self.completed,
            BrokerState::Failed => &mut self.failed,
            _ => return,
        };
        while list.len() > keep {
            if let Some(id) = list.pop_front() {
                if self.jobs.get(&id).is_some_and(|j| j.state == state) {
                    self.jobs.remove(&id);
                }
            }
        }
    }

    fn forget(&mut self, id: &JobId) {
        self.pending.retain(|p| p != id);
        self.completed.retain(|p| p != id);
        self.failed.retain(|p| p != id);
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: HashMap<JobKind, QueueState>,
    unavailable: bool,
    fail_removals: bool,
}

/// In-memory broker for tests/dev.
///
/// Can simulate an outage (`set_unavailable`) or refuse removals (`fail_removals`).
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    pub fn fail_removals(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_removals = fail;
        }
    }

    /// Force an entry into `Active` with a given heartbeat, as a crashed worker would leave it.
    pub fn force_active(&self, queue: JobKind, id: &JobId, heartbeat_at: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            let state = inner.queues.entry(queue).or_default();
            state.pending.retain(|p| p != id);
            if let Some(job) = state.jobs.get_mut(id) {
                job.mark_active(heartbeat_at);
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerInner>, BrokerError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker lock poisoned".to_string()))?;
        if inner.unavailable {
            return Err(BrokerError::Unavailable("broker offline".to_string()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: JobKind,
        data: QueuedJob,
        options: JobOptions,
    ) -> Result<BrokerJob, BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let id = data.job_id.clone();

        if let Some(existing) = state.jobs.get(&id) {
            if !existing.state.is_finished() {
                return Err(BrokerError::AlreadyExists(id));
            }
            state.forget(&id);
        }

        let job = BrokerJob::new(queue, data, options, Utc::now());
        state.jobs.insert(id.clone(), job.clone());
        state.pending.push_back(id);
        Ok(job)
    }

    async fn reserve(&self, queue: JobKind) -> Result<Option<BrokerJob>, BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let now = Utc::now();

        let position = state
            .pending
            .iter()
            .position(|id| state.jobs.get(id).is_some_and(|j| j.is_ready(now)));
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(id) = state.pending.remove(position) else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_active(now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        match state.jobs.get_mut(id) {
            Some(job) if job.state == BrokerState::Active => {
                job.heartbeat_at = Some(Utc::now());
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(BrokerError::NotFound(id.clone())),
        }
    }

    async fn complete(&self, queue: JobKind, id: &JobId) -> Result<(), BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
        job.mark_completed(Utc::now());
        let keep = job.options.keep_completed;
        state.completed.push_back(id.clone());
        state.trim(BrokerState::Completed, keep);
        Ok(())
    }

    async fn fail(
        &self,
        queue: JobKind,
        id: &JobId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailOutcome, BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
        let outcome = job.mark_failed(reason, retryable, Utc::now());
        let keep = job.options.keep_failed;
        match outcome {
            FailOutcome::Retrying { .. } => state.pending.push_back(id.clone()),
            FailOutcome::Failed { .. } => {
                state.failed.push_back(id.clone());
                state.trim(BrokerState::Failed, keep);
            }
        }
        Ok(outcome)
    }

    async fn get(&self, queue: JobKind, id: &JobId) -> Result<Option<BrokerJob>, BrokerError> {
        let inner = self.lock()?;
        Ok(inner.queues.get(&queue).and_then(|s| s.jobs.get(id).cloned()))
    }

    async fn jobs_in_states(
        &self,
        queue: JobKind,
        states: &[BrokerState],
    ) -> Result<Vec<BrokerJob>, BrokerError> {
        let inner = self.lock()?;
        let mut jobs: Vec<BrokerJob> = inner
            .queues
            .get(&queue)
            .map(|s| {
                s.jobs
                    .values()
                    .filter(|j| states.contains(&j.state))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        jobs.sort_by_key(|j| j.enqueued_at);
        Ok(jobs)
    }

    async fn update_data(
        &self,
        queue: JobKind,
        id: &JobId,
        data: QueuedJob,
    ) -> Result<(), BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
        job.data = data;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn remove(&self, queue: JobKind, id: &JobId) -> Result<bool, BrokerError> {
        let mut inner = self.lock()?;
        if inner.fail_removals {
            return Err(BrokerError::Command(format!("remove {id} refused")));
        }
        let state = inner.queues.entry(queue).or_default();
        state.forget(id);
        let removed = state.jobs.remove(id).is_some();
        debug!(queue = %queue, job_id = %id, removed, "broker entry removed");
        Ok(removed)
    }

    async fn counts(&self, queue: JobKind) -> Result<QueueCounts, BrokerError> {
        let inner = self.lock()?;
        let mut counts = QueueCounts::default();
        if let Some(state) = inner.queues.get(&queue) {
            for job in state.jobs.values() {
                counts.bump(job.state);
            }
        }
        Ok(counts)
    }

    async fn requeue_stalled(
        &self,
        queue: JobKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BrokerError> {
        let mut inner = self.lock()?;
        let state = inner.queues.entry(queue).or_default();
        let now = Utc::now();

        let mut stalled: Vec<&mut BrokerJob> = state
            .jobs
            .values_mut()
            .filter(|j| {
                j.state == BrokerState::Active
                    && !j.data.restart_reconciled
                    && j.heartbeat_at.is_none_or(|at| at < cutoff)
            })
            .collect();
        stalled.sort_by_key(|j| j.enqueued_at);

        let mut ids = Vec::with_capacity(stalled.len());
        for job in stalled {
            job.mark_stalled(now);
            ids.push(job.id.clone());
        }
        state.pending.extend(ids.iter().cloned());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;
    use clipforge_core::{RecordId, UserId};
    use clipforge_generation::{EffectRequest, JobPayload};
    use std::time::Duration;

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
    async fn enqueue_and_reserve_in_arrival_order() {
        let broker = InMemoryBroker::new();
        let first = queued();
        let second = queued();
        broker
            .enqueue(JobKind::Effect, first.clone(), JobOptions::default())
            .await
            .unwrap();
        broker
            .enqueue(JobKind::Effect, second.clone(), JobOptions::default())
            .await
            .unwrap();

        let claimed = broker.reserve(JobKind::Effect).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.job_id);
        assert_eq!(claimed.state, BrokerState::Active);
        assert_eq!(claimed.attempts_made, 1);

        let claimed = broker.reserve(JobKind::Effect).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.job_id);
        assert!(broker.reserve(JobKind::Effect).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(JobKind::Effect, queued(), JobOptions::default())
            .await
            .unwrap();
        assert!(broker.reserve(JobKind::Story).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_duplicate_is_rejected_finished_is_replaced() {
        let broker = InMemoryBroker::new();
        let data = queued();
        broker
            .enqueue(JobKind::Effect, data.clone(), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(
            broker
                .enqueue(JobKind::Effect, data.clone(), JobOptions::default())
                .await
                .unwrap_err(),
            BrokerError::AlreadyExists(data.job_id.clone())
        );

        broker.reserve(JobKind::Effect).await.unwrap();
        broker
            .fail(JobKind::Effect, &data.job_id, "boom", false)
            .await
            .unwrap();
        let again = broker
            .enqueue(JobKind::Effect, data.clone(), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(again.state, BrokerState::Waiting);
        assert_eq!(again.attempts_made, 0);
    }

    #[tokio::test]
    async fn retryable_failure_redelivers_after_backoff() {
        let broker = InMemoryBroker::new();
        let data = queued();
        let options = JobOptions {
            retry: RetryPolicy::fixed(2, Duration::from_millis(20)),
            ..Default::default()
        };
        broker
            .enqueue(JobKind::Effect, data.clone(), options)
            .await
            .unwrap();

        broker.reserve(JobKind::Effect).await.unwrap();
        let outcome = broker
            .fail(JobKind::Effect, &data.job_id, "rate limited", true)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));
        assert!(broker.reserve(JobKind::Effect).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = broker.reserve(JobKind::Effect).await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn retention_drops_oldest_finished_entries() {
        let broker = InMemoryBroker::new();
        let options = JobOptions {
            keep_completed: 2,
            ..Default::default()
        };
        let mut ids = Vec::new();
        for _ in 0..4 {
            let data = queued();
            ids.push(data.job_id.clone());
            broker
                .enqueue(JobKind::Effect, data, options.clone())
                .await
                .unwrap();
            let claimed = broker.reserve(JobKind::Effect).await.unwrap().unwrap();
            broker.complete(JobKind::Effect, &claimed.id).await.unwrap();
        }

        let counts = broker.counts(JobKind::Effect).await.unwrap();
        assert_eq!(counts.completed, 2);
        assert!(broker.get(JobKind::Effect, &ids[0]).await.unwrap().is_none());
        assert!(broker.get(JobKind::Effect, &ids[3]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stalled_entries_are_requeued_unless_reconciled() {
        let broker = InMemoryBroker::new();
        let stalled = queued();
        let mut reconciled = queued();
        for data in [stalled.clone(), reconciled.clone()] {
            broker
                .enqueue(JobKind::Effect, data, JobOptions::default())
                .await
                .unwrap();
        }
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        broker.force_active(JobKind::Effect, &stalled.job_id, long_ago);
        broker.force_active(JobKind::Effect, &reconciled.job_id, long_ago);
        reconciled.restart_reconciled = true;
        broker
            .update_data(JobKind::Effect, &reconciled.job_id, reconciled.clone())
            .await
            .unwrap();

        let requeued = broker
            .requeue_stalled(JobKind::Effect, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(requeued, vec![stalled.job_id.clone()]);

        let counts = broker.counts(JobKind::Effect).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let err = broker
            .enqueue(JobKind::Story, queued(), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }
}
