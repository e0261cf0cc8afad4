//! Outcome reconciliation.
//!
//! Workers report outcomes over a channel; this module applies them to persisted
//! state. The failure path is shared by live failures and restart recovery: a refund
//! is issued only when the Job's `pending | processing → failed` transition actually
//! applies, so each debit is refunded at most once.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clipforge_events::{NotificationEvent, QueueEvent, RealtimeChannel, user_channel};
use clipforge_generation::{GenerationOutput, QueuedJob};
use clipforge_pipeline::JobFailure;

use crate::Ledger;
use crate::jobs::JobOutcome;
use crate::notifications::Notifier;
use crate::repo::{JobRepository, RecordRepository, RepositoryError};

/// Result of running the failure path for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHandling {
    /// The job transitioned to `failed`; `refunded` credits went back to the user.
    Reconciled { refunded: i64 },
    /// The job was already terminal; nothing was changed.
    AlreadyTerminal,
}

#[derive(Clone)]
pub struct OutcomeHandler {
    jobs: Arc<dyn JobRepository>,
    records: Arc<dyn RecordRepository>,
    ledger: Ledger,
    notifier: Notifier,
    realtime: Arc<dyn RealtimeChannel>,
}

impl OutcomeHandler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        records: Arc<dyn RecordRepository>,
        ledger: Ledger,
        notifier: Notifier,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Self {
        Self {
            jobs,
            records,
            ledger,
            notifier,
            realtime,
        }
    }

    pub async fn handle(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Active { job } => self.on_active(&job).await,
            JobOutcome::Completed { job, output } => self.on_completed(&job, &output).await,
            JobOutcome::Failed {
                job,
                failure,
                attempts,
            } => {
                debug!(job_id = %job.job_id, attempts, "terminal failure reported");
                self.on_failed(&job, &failure).await;
            }
        }
    }

    pub async fn on_active(&self, job: &QueuedJob) {
        match self.jobs.mark_processing(&job.job_id, Utc::now()).await {
            Ok(true) => debug!(job_id = %job.job_id, "job processing"),
            Ok(false) => debug!(job_id = %job.job_id, "job was not pending; status unchanged"),
            Err(e) => warn!(job_id = %job.job_id, error = %e, "failed to mark job processing"),
        }
    }

    /// Persist the result, then announce it. A persistence failure keeps the debit.
    pub async fn on_completed(&self, job: &QueuedJob, output: &GenerationOutput) {
        let now = Utc::now();
        let kind = job.kind();

        let persisted = match self.jobs.complete(&job.job_id, output, now).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                warn!(job_id = %job.job_id, "completion ignored: job already terminal");
                return;
            }
            Err(e) => {
                self.log_persistence_failure(job, output, &e);
                return;
            }
        };

        if let Err(e) = self
            .records
            .mark_completed(persisted.record_id, output, now)
            .await
        {
            self.log_persistence_failure(job, output, &e);
            return;
        }

        let event = QueueEvent::completed(job.job_id.clone(), kind, output.result_url.clone());
        self.realtime.emit(
            &user_channel(job.user_id),
            event.event_name(),
            event.to_payload(),
        );

        self.notifier
            .notify(
                job.user_id,
                &NotificationEvent::job_completed(
                    kind,
                    &job.job_id,
                    persisted.record_id,
                    &output.result_url,
                ),
            )
            .await;

        info!(
            job_id = %job.job_id,
            queue = %kind,
            result_url = %output.result_url,
            "job completed"
        );
    }

    fn log_persistence_failure(
        &self,
        job: &QueuedJob,
        output: &GenerationOutput,
        e: &RepositoryError,
    ) {
        let failure = JobFailure::persistence(e.to_string());
        error!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            result_url = %output.result_url,
            error = %failure,
            "generated output could not be persisted; debit kept"
        );
    }

    /// Broker-level terminal failure. Entries already reconciled on restart are skipped.
    pub async fn on_failed(&self, job: &QueuedJob, failure: &JobFailure) -> FailureHandling {
        if job.restart_reconciled {
            info!(job_id = %job.job_id, "failure already reconciled on restart; skipping");
            return FailureHandling::AlreadyTerminal;
        }
        self.fail_job(job, failure).await
    }

    /// Synthetic failure for a job interrupted by a process restart.
    pub async fn reconcile_interrupted(&self, job: &QueuedJob) -> FailureHandling {
        self.fail_job(job, &JobFailure::restart_interruption()).await
    }

    pub async fn fail_job(&self, job: &QueuedJob, failure: &JobFailure) -> FailureHandling {
        let now = Utc::now();
        let kind = job.kind();
        let message = failure.to_string();

        let failed = match self.jobs.fail(&job.job_id, &message, now).await {
            Ok(Some(failed)) => failed,
            Ok(None) => {
                debug!(job_id = %job.job_id, "job already terminal; failure not applied");
                return FailureHandling::AlreadyTerminal;
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to mark job failed");
                return FailureHandling::AlreadyTerminal;
            }
        };

        let mut refunded = 0;
        if failure.kind.refunds() {
            match self.ledger.add_credits(failed.user_id, failed.cost).await {
                Ok(balance) => {
                    refunded = failed.cost;
                    info!(
                        job_id = %job.job_id,
                        user_id = %failed.user_id,
                        amount = failed.cost,
                        balance,
                        "credits refunded"
                    );
                }
                Err(e) => error!(
                    job_id = %job.job_id,
                    user_id = %failed.user_id,
                    amount = failed.cost,
                    error = %e,
                    "refund failed; needs manual reconciliation"
                ),
            }
        }

        if let Err(e) = self
            .records
            .mark_failed(failed.record_id, &message, now)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to mark record failed");
        }

        let event = QueueEvent::failed(job.job_id.clone(), kind, message.clone());
        self.realtime.emit(
            &user_channel(job.user_id),
            event.event_name(),
            event.to_payload(),
        );

        self.notifier
            .notify(
                job.user_id,
                &NotificationEvent::job_failed(
                    kind,
                    &job.job_id,
                    failed.record_id,
                    &message,
                    refunded,
                ),
            )
            .await;

        warn!(
            job_id = %job.job_id,
            queue = %kind,
            failure = %failure.kind,
            refunded,
            "job failed"
        );
        FailureHandling::Reconciled { refunded }
    }

    /// Consume worker outcomes until every sender is gone or `shutdown` fires.
    pub fn spawn_reconciler(
        self,
        mut outcomes: mpsc::Receiver<JobOutcome>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = outcomes.recv() => match next {
                        Some(outcome) => self.handle(outcome).await,
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        while let Ok(outcome) = outcomes.try_recv() {
                            self.handle(outcome).await;
                        }
                        break;
                    }
                }
            }
            debug!("outcome reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{
        InMemoryPushDelivery, InMemoryUserDirectory, StaticTranslator,
    };
    use crate::repo::{
        InMemoryJobRepository, InMemoryNotificationStore, InMemoryRecordRepository,
        NotificationStore,
    };
    use clipforge_core::{JobId, RecordId, UserId};
    use clipforge_events::InMemoryRealtimeHub;
    use clipforge_generation::{
        EffectRequest, GenerationRecord, Job, JobPayload, JobStatus,
    };
    use clipforge_ledger::{AmountBand, CreditLedger, CreditStore, InMemoryCreditStore};

    struct Fixture {
        handler: OutcomeHandler,
        jobs: Arc<InMemoryJobRepository>,
        records: Arc<InMemoryRecordRepository>,
        credits: Arc<InMemoryCreditStore>,
        notifications: Arc<InMemoryNotificationStore>,
    }

    fn fixture() -> Fixture {
        let jobs = InMemoryJobRepository::arc();
        let records = InMemoryRecordRepository::arc();
        let credits = InMemoryCreditStore::arc();
        let notifications = InMemoryNotificationStore::arc();
        let hub: Arc<InMemoryRealtimeHub> = Arc::new(InMemoryRealtimeHub::new());
        let store: Arc<dyn CreditStore> = credits.clone();
        let notifier = Notifier::new(
            Arc::new(StaticTranslator::new()),
            InMemoryUserDirectory::arc(),
            InMemoryPushDelivery::arc(),
            notifications.clone(),
            hub.clone(),
        );
        let handler = OutcomeHandler::new(
            jobs.clone(),
            records.clone(),
            CreditLedger::new(store, AmountBand::default()),
            notifier,
            hub,
        );
        Fixture {
            handler,
            jobs,
            records,
            credits,
            notifications,
        }
    }

    async fn seed(f: &Fixture, user: UserId, cost: i64) -> QueuedJob {
        let now = Utc::now();
        let record_id = RecordId::new();
        let payload = JobPayload::Effect(EffectRequest {
            effect_id: "glow".to_string(),
            image_url: "https://cdn.example/in.png".to_string(),
            prompt: None,
        });
        let job = Job::new(JobId::generate(), user, record_id, payload, cost, now);
        f.jobs.insert(&job).await.unwrap();
        f.records
            .insert(&GenerationRecord::pending(
                record_id,
                job.job_id.clone(),
                user,
                job.kind(),
                cost,
                now,
            ))
            .await
            .unwrap();
        // Balance after the submission debit.
        f.credits.set_balance(user, 100 - cost);
        QueuedJob::from_job(&job)
    }

    #[tokio::test]
    async fn provider_failure_refunds_once() {
        let f = fixture();
        let user = UserId::new();
        let queued = seed(&f, user, 20).await;

        let first = f
            .handler
            .on_failed(&queued, &JobFailure::provider("bad output"))
            .await;
        let second = f
            .handler
            .fail_job(&queued, &JobFailure::provider("late duplicate"))
            .await;

        assert_eq!(first, FailureHandling::Reconciled { refunded: 20 });
        assert_eq!(second, FailureHandling::AlreadyTerminal);
        assert_eq!(f.credits.balance(user).await.unwrap(), 100);

        let job = f.jobs.get(&queued.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let record = f.records.find_by_job(&queued.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(f.notifications.list_for_user(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_is_not_refunded() {
        let f = fixture();
        let user = UserId::new();
        let queued = seed(&f, user, 20).await;

        let handled = f
            .handler
            .fail_job(&queued, &JobFailure::persistence("write failed"))
            .await;

        assert_eq!(handled, FailureHandling::Reconciled { refunded: 0 });
        assert_eq!(f.credits.balance(user).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn restart_marked_entries_are_skipped() {
        let f = fixture();
        let user = UserId::new();
        let mut queued = seed(&f, user, 20).await;
        queued.restart_reconciled = true;

        let handled = f
            .handler
            .on_failed(&queued, &JobFailure::provider("late callback"))
            .await;

        assert_eq!(handled, FailureHandling::AlreadyTerminal);
        assert_eq!(f.credits.balance(user).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn completion_updates_job_and_record() {
        let f = fixture();
        let user = UserId::new();
        let queued = seed(&f, user, 20).await;
        let output = GenerationOutput::new("https://cdn.example/out.mp4");

        f.handler.on_active(&queued).await;
        f.handler.on_completed(&queued, &output).await;

        let job = f.jobs.get(&queued.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let record = f.records.find_by_job(&queued.job_id).await.unwrap().unwrap();
        assert_eq!(record.result_url.as_deref(), Some("https://cdn.example/out.mp4"));
        assert_eq!(f.credits.balance(user).await.unwrap(), 80);
        assert_eq!(f.notifications.list_for_user(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_write_failure_keeps_debit_and_skips_notification() {
        let f = fixture();
        let user = UserId::new();
        let queued = seed(&f, user, 20).await;
        f.jobs.fail_writes(true);

        f.handler
            .on_completed(&queued, &GenerationOutput::new("https://cdn.example/out.mp4"))
            .await;

        assert_eq!(f.credits.balance(user).await.unwrap(), 80);
        assert!(f.notifications.list_for_user(user).await.unwrap().is_empty());
    }
}
