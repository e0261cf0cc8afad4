//! End-to-end flow with in-memory adapters and scripted providers.
//!
//! submit → broker → worker → pipeline → outcome reconciliation → ledger / records /
//! notifications, plus restart recovery.
//!
//! Verifies:
//! - Failed jobs are refunded exactly what was debited; completed jobs keep the debit
//! - Resubmitting an in-flight job id neither debits nor records twice
//! - Recovery fails interrupted jobs once, with one refund and one notification
//! - Story video fallback succeeds, and a double failure never completes the record

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use clipforge_core::{JobId, UserId};
use clipforge_events::{InMemoryRealtimeHub, event_names, user_channel};
use clipforge_generation::{
    AspectRatio, CreditPricing, EffectRequest, Job, JobKind, JobPayload, JobStatus, QueuedJob,
    StoryRequest,
};
use clipforge_ledger::{AmountBand, CreditLedger, CreditStore, InMemoryCreditStore};
use clipforge_pipeline::fakes::ops;
use clipforge_pipeline::{
    EffectConfig, EffectExecutor, FakeProviders, GenerationLibExecutor, JobFailure,
    PipelineDispatcher, StoryConfig, StoryExecutor,
};

use crate::jobs::{Broker, InMemoryBroker, JobOptions, QueueWorker, QueueWorkerHandle, WorkerConfig};
use crate::notifications::{InMemoryPushDelivery, InMemoryUserDirectory, Notifier, StaticTranslator};
use crate::outcome::OutcomeHandler;
use crate::recovery::RecoveryManager;
use crate::repo::{
    InMemoryJobRepository, InMemoryNotificationStore, InMemoryRecordRepository, JobRepository,
    NotificationStore, RecordRepository, RepositoryJobLookup,
};
use crate::service::{JobService, SubmitError, SubmitRequest};

const START_BALANCE: i64 = 100;

struct Harness {
    service: JobService,
    outcomes: OutcomeHandler,
    jobs: Arc<InMemoryJobRepository>,
    records: Arc<InMemoryRecordRepository>,
    notifications: Arc<InMemoryNotificationStore>,
    credits: Arc<InMemoryCreditStore>,
    broker: Arc<InMemoryBroker>,
    hub: Arc<InMemoryRealtimeHub>,
    fakes: Arc<FakeProviders>,
    dispatcher: PipelineDispatcher,
    shutdown: CancellationToken,
    workers: Vec<QueueWorkerHandle>,
    reconciler: Option<JoinHandle<()>>,
}

impl Harness {
    fn new() -> Self {
        let jobs = InMemoryJobRepository::arc();
        let records = InMemoryRecordRepository::arc();
        let notifications = InMemoryNotificationStore::arc();
        let credits = InMemoryCreditStore::arc();
        let broker = InMemoryBroker::arc();
        let hub = Arc::new(InMemoryRealtimeHub::new());
        let fakes = FakeProviders::new();

        let store: Arc<dyn CreditStore> = credits.clone();
        let ledger = CreditLedger::new(store, AmountBand::default());
        let notifier = Notifier::new(
            Arc::new(StaticTranslator::new()),
            InMemoryUserDirectory::arc(),
            InMemoryPushDelivery::arc(),
            notifications.clone(),
            hub.clone(),
        );
        let outcomes = OutcomeHandler::new(
            jobs.clone(),
            records.clone(),
            ledger.clone(),
            notifier,
            hub.clone(),
        );
        let service = JobService::new(
            jobs.clone(),
            records.clone(),
            ledger,
            broker.clone(),
            CreditPricing::default(),
        );
        let dispatcher = PipelineDispatcher::new(
            StoryExecutor::new(fakes.story_providers(), StoryConfig::default()),
            EffectExecutor::new(fakes.clone(), EffectConfig::default()),
            GenerationLibExecutor::new(
                fakes.clone(),
                fakes.clone(),
                fakes.clone(),
                EffectConfig::default(),
            ),
            Arc::new(RepositoryJobLookup::new(jobs.clone())),
            hub.clone(),
        );

        Self {
            service,
            outcomes,
            jobs,
            records,
            notifications,
            credits,
            broker,
            hub,
            fakes,
            dispatcher,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
            reconciler: None,
        }
    }

    fn start(&mut self) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        for queue in JobKind::ALL {
            let worker = QueueWorker::new(
                self.broker.clone(),
                Arc::new(self.dispatcher.clone()),
                tx.clone(),
                WorkerConfig::new(queue)
                    .with_concurrency(2)
                    .with_poll_interval(Duration::from_millis(5)),
            );
            self.workers.push(worker.spawn(self.shutdown.child_token()));
        }
        self.reconciler = Some(
            self.outcomes
                .clone()
                .spawn_reconciler(rx, self.shutdown.clone()),
        );
    }

    /// Stop workers, then let the reconciler drain what they reported.
    async fn stop(&mut self) {
        for worker in self.workers.drain(..) {
            worker.shutdown().await;
        }
        self.shutdown.cancel();
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.await.unwrap();
        }
    }

    fn user(&self) -> UserId {
        let user = UserId::new();
        self.credits.set_balance(user, START_BALANCE);
        user
    }

    async fn balance(&self, user: UserId) -> i64 {
        self.credits.balance(user).await.unwrap()
    }

    async fn wait_terminal(&self, job_id: &JobId) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.jobs.get(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            assert!(Instant::now() < deadline, "job {job_id} never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(self.broker.clone(), self.jobs.clone(), self.outcomes.clone())
    }
}

fn story(scenes: u8) -> JobPayload {
    JobPayload::Story(StoryRequest {
        prompt: "a lighthouse keeper befriends a whale".to_string(),
        num_of_scenes: scenes,
        style: None,
        aspect_ratio: AspectRatio::Portrait,
        voice_over: None,
    })
}

fn effect() -> JobPayload {
    JobPayload::Effect(EffectRequest {
        effect_id: "effects/zoom".to_string(),
        image_url: "https://img.test/portrait.png".to_string(),
        prompt: None,
    })
}

fn submit(user: UserId, payload: JobPayload) -> SubmitRequest {
    SubmitRequest {
        user_id: user,
        job_id: None,
        payload,
    }
}

#[tokio::test]
async fn story_job_runs_every_stage_and_completes_the_record() {
    let mut h = Harness::new();
    let user = h.user();
    let mut channel = h.hub.subscribe(user_channel(user));
    h.start();

    let submission = h.service.submit(submit(user, story(3))).await.unwrap();
    let job = h.wait_terminal(&submission.job_id).await;
    h.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    let record = h.records.get(submission.record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.result_url.as_deref().is_some_and(|url| !url.is_empty()));

    assert_eq!(h.fakes.calls(ops::TEXT), 1);
    assert_eq!(h.fakes.calls(ops::IMAGE), 1);
    assert_eq!(h.fakes.calls(ops::VIDEO), 3);
    assert_eq!(h.fakes.calls(ops::CONCAT), 1);
    assert_eq!(h.fakes.calls(ops::UPLOAD), 1);
    assert_eq!(h.fakes.calls(ops::SPEECH), 0);

    // Completed: the debit stands, no refund.
    assert_eq!(h.balance(user).await, START_BALANCE - submission.cost);

    let events: Vec<String> = channel.drain().into_iter().map(|m| m.event).collect();
    assert!(events.iter().any(|e| e == event_names::JOB_COMPLETED));
    assert!(events.iter().any(|e| e == event_names::NOTIFICATION));
}

#[tokio::test]
async fn provider_failure_refunds_exactly_the_debit() {
    let mut h = Harness::new();
    let user = h.user();
    h.fakes.fail_invoke();
    h.start();

    let submission = h.service.submit(submit(user, effect())).await.unwrap();
    let job = h.wait_terminal(&submission.job_id).await;
    h.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.balance(user).await, START_BALANCE);
    let journal: Vec<i64> = h.credits.journal(user).iter().map(|e| e.delta).collect();
    assert_eq!(journal, vec![-submission.cost, submission.cost]);

    let record = h.records.get(submission.record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.result_url.is_none());
    assert_eq!(h.notifications.list_for_user(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn resubmitting_in_flight_job_id_does_not_double_charge() {
    let h = Harness::new();
    let user = h.user();
    let job_id = JobId::generate();
    let request = SubmitRequest {
        user_id: user,
        job_id: Some(job_id.clone()),
        payload: effect(),
    };

    let first = h.service.submit(request.clone()).await.unwrap();
    let second = h.service.submit(request).await.unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(h.balance(user).await, START_BALANCE - first.cost);
    assert_eq!(h.records.list_for_user(user).await.unwrap().len(), 1);
    assert_eq!(h.broker.counts(JobKind::Effect).await.unwrap().waiting, 1);
}

#[tokio::test]
async fn recovery_fails_orphaned_active_job_once() {
    let h = Harness::new();
    let user = h.user();
    let submission = h.service.submit(submit(user, effect())).await.unwrap();

    // Crash mid-flight: the job went active, then its broker entry vanished.
    let job = h.jobs.get(&submission.job_id).await.unwrap().unwrap();
    h.outcomes.on_active(&QueuedJob::from_job(&job)).await;
    assert!(h.broker.remove(JobKind::Effect, &submission.job_id).await.unwrap());

    let report = h.recovery().run().await.unwrap();
    let again = h.recovery().run().await.unwrap();

    assert_eq!(report.orphans_reconciled, 1);
    assert_eq!(again.orphans_reconciled, 0);
    let job = h.jobs.get(&submission.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.balance(user).await, START_BALANCE);
    assert_eq!(h.credits.journal(user).len(), 2);
    assert_eq!(h.notifications.list_for_user(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn late_failure_callback_after_recovery_is_ignored() {
    let h = Harness::new();
    let user = h.user();
    let submission = h.service.submit(submit(user, effect())).await.unwrap();
    h.broker.force_active(JobKind::Effect, &submission.job_id, chrono::Utc::now());
    h.broker.fail_removals(true);

    h.recovery().run().await.unwrap();

    // The broker still holds the tagged entry and later reports it failed.
    let entry = h
        .broker
        .get(JobKind::Effect, &submission.job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(entry.data.restart_reconciled);
    h.outcomes
        .on_failed(&entry.data, &JobFailure::provider("stalled"))
        .await;

    assert_eq!(h.balance(user).await, START_BALANCE);
    assert_eq!(h.credits.journal(user).len(), 2);
    assert_eq!(h.notifications.list_for_user(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn story_video_fallback_recovers_a_failed_batch() {
    let mut h = Harness::new();
    let user = h.user();
    for scene in 0..3 {
        h.fakes.fail_video_attempts(scene, 1);
    }
    h.start();

    let submission = h.service.submit(submit(user, story(3))).await.unwrap();
    let job = h.wait_terminal(&submission.job_id).await;
    h.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    // Three failed batch calls, then three sequential successes.
    assert_eq!(h.fakes.video_attempts().len(), 6);
    assert_eq!(h.fakes.calls(ops::CONCAT), 1);
}

#[tokio::test]
async fn story_video_double_failure_never_completes_the_record() {
    let mut h = Harness::new();
    let user = h.user();
    h.fakes.fail_video_attempts(1, 2);
    h.start();

    let submission = h.service.submit(submit(user, story(3))).await.unwrap();
    let job = h.wait_terminal(&submission.job_id).await;
    h.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().is_some_and(|e| e.starts_with("provider")));
    let record = h.records.get(submission.record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.result_url.is_none());
    assert_eq!(h.fakes.calls(ops::UPLOAD), 0);
    assert_eq!(h.balance(user).await, START_BALANCE);
}

#[tokio::test]
async fn insufficient_credits_is_a_client_error_with_no_job() {
    let h = Harness::new();
    let user = UserId::new();
    h.credits.set_balance(user, 5);
    let job_id = JobId::generate();

    let err = h
        .service
        .submit(SubmitRequest {
            user_id: user,
            job_id: Some(job_id.clone()),
            payload: story(3),
        })
        .await
        .unwrap_err();

    assert!(err.is_client_error());
    assert!(matches!(err, SubmitError::InsufficientCredits { balance: 5, required: 30 }));
    assert!(h.jobs.get(&job_id).await.unwrap().is_none());
    assert_eq!(h.balance(user).await, 5);
}

#[tokio::test]
async fn retrying_a_completed_job_is_a_conflict_without_provider_calls() {
    let mut h = Harness::new();
    let user = h.user();
    h.start();

    let submission = h.service.submit(submit(user, effect())).await.unwrap();
    h.wait_terminal(&submission.job_id).await;
    h.stop().await;
    let calls_before = h.fakes.total_calls();

    let err = h
        .service
        .retry(user, &submission.job_id)
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::IdempotencyConflict(_)));
    assert_eq!(h.fakes.total_calls(), calls_before);
    assert_eq!(h.balance(user).await, START_BALANCE - submission.cost);
}

#[tokio::test]
async fn retried_failure_completes_under_the_same_job_id() {
    let mut h = Harness::new();
    let user = h.user();
    h.fakes.fail_video_attempts(0, 2);
    h.start();

    let submission = h.service.submit(submit(user, story(2))).await.unwrap();
    let failed = h.wait_terminal(&submission.job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);

    let retried = h.service.retry(user, &submission.job_id).await.unwrap();
    assert_eq!(retried.job_id, submission.job_id);

    let job = h.wait_terminal(&submission.job_id).await;
    h.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.balance(user).await, START_BALANCE - submission.cost);
    let record = h.records.get(submission.record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
}
