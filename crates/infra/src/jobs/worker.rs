//! Queue worker: reserve, execute with heartbeat, report the outcome.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use clipforge_core::JobId;
use clipforge_generation::{GenerationOutput, JobKind, QueuedJob};
use clipforge_pipeline::{JobFailure, PipelineExecutor};

use super::store::Broker;
use super::types::{BrokerJob, FailOutcome};

/// What a worker hands to the reconciliation routine.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Delivery started.
    Active { job: QueuedJob },
    Completed {
        job: QueuedJob,
        output: GenerationOutput,
    },
    /// Terminal failure: the broker will not deliver this entry again.
    Failed {
        job: QueuedJob,
        failure: JobFailure,
        attempts: u32,
    },
}

impl JobOutcome {
    pub fn job(&self) -> &QueuedJob {
        match self {
            JobOutcome::Active { job }
            | JobOutcome::Completed { job, .. }
            | JobOutcome::Failed { job, .. } => job,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: JobKind,
    /// Jobs from this queue executing at once
    pub concurrency: usize,
    /// Sleep between empty polls
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Active entries silent for longer than this are requeued
    pub stall_interval: Duration,
}

impl WorkerConfig {
    pub fn new(queue: JobKind) -> Self {
        Self {
            queue,
            concurrency: 1,
            poll_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(15),
            stall_interval: Duration::from_secs(120),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stall_interval(mut self, interval: Duration) -> Self {
        self.stall_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub stalled_requeued: u64,
    pub current_running: usize,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl QueueWorkerHandle {
    /// Stop reserving and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "queue worker task panicked");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Consumes one queue with bounded concurrency.
pub struct QueueWorker {
    broker: Arc<dyn Broker>,
    executor: Arc<dyn PipelineExecutor>,
    outcomes: mpsc::Sender<JobOutcome>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        executor: Arc<dyn PipelineExecutor>,
        outcomes: mpsc::Sender<JobOutcome>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            executor,
            outcomes,
            config,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> QueueWorkerHandle {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker = Arc::new(self);
        let join = tokio::spawn(worker.run(shutdown.clone(), stats.clone()));
        QueueWorkerHandle {
            shutdown,
            join,
            stats,
        }
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken, stats: Arc<Mutex<WorkerStats>>) {
        let queue = self.config.queue;
        info!(queue = %queue, concurrency = self.config.concurrency, "queue worker started");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let sweep_every = self.config.stall_interval / 2;
        let mut last_sweep = Instant::now();

        loop {
            if last_sweep.elapsed() >= sweep_every {
                self.sweep_stalled(&stats).await;
                last_sweep = Instant::now();
            }
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.broker.reserve(queue).await {
                Ok(Some(job)) => {
                    debug!(queue = %queue, job_id = %job.id, attempt = job.attempts_made, "reserved job");
                    in_flight.spawn(self.clone().process(job, permit, stats.clone()));
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue, error = %e, "failed to reserve job");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(queue = %queue, "queue worker stopped");
    }

    async fn process(
        self: Arc<Self>,
        job: BrokerJob,
        _permit: OwnedSemaphorePermit,
        stats: Arc<Mutex<WorkerStats>>,
    ) {
        let queue = self.config.queue;
        let id = job.id.clone();

        if job.data.restart_reconciled {
            warn!(queue = %queue, job_id = %id, "skipping entry already reconciled after restart");
            if let Err(e) = self.broker.remove(queue, &id).await {
                warn!(queue = %queue, job_id = %id, error = %e, "failed to drop reconciled entry");
            }
            return;
        }

        update(&stats, |s| s.current_running += 1);
        self.send(JobOutcome::Active {
            job: job.data.clone(),
        })
        .await;

        let heartbeat = self.spawn_heartbeat(id.clone());
        let result = self.executor.execute(&job.data).await;
        drop(heartbeat);

        match result {
            Ok(output) => {
                if let Err(e) = self.broker.complete(queue, &id).await {
                    warn!(queue = %queue, job_id = %id, error = %e, "failed to mark broker entry completed");
                }
                update(&stats, |s| {
                    s.jobs_processed += 1;
                    s.jobs_succeeded += 1;
                });
                self.send(JobOutcome::Completed {
                    job: job.data,
                    output,
                })
                .await;
            }
            Err(failure) => {
                let retryable = failure.kind.is_retryable();
                match self
                    .broker
                    .fail(queue, &id, &failure.to_string(), retryable)
                    .await
                {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        warn!(
                            queue = %queue,
                            job_id = %id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "delivery failed; redelivery scheduled"
                        );
                        update(&stats, |s| {
                            s.jobs_processed += 1;
                            s.jobs_retried += 1;
                        });
                    }
                    Ok(FailOutcome::Failed { attempts }) => {
                        let data = self.latest_data(&id, job.data).await;
                        update(&stats, |s| {
                            s.jobs_processed += 1;
                            s.jobs_failed += 1;
                        });
                        self.send(JobOutcome::Failed {
                            job: data,
                            failure,
                            attempts,
                        })
                        .await;
                    }
                    Err(e) => {
                        error!(
                            queue = %queue,
                            job_id = %id,
                            error = %e,
                            "could not record failure in broker; treating as terminal"
                        );
                        update(&stats, |s| {
                            s.jobs_processed += 1;
                            s.jobs_failed += 1;
                        });
                        self.send(JobOutcome::Failed {
                            job: job.data,
                            failure,
                            attempts: job.attempts_made,
                        })
                        .await;
                    }
                }
            }
        }

        update(&stats, |s| s.current_running = s.current_running.saturating_sub(1));
    }

    /// The entry's data as the broker has it now; the restart marker may have been set.
    async fn latest_data(&self, id: &JobId, fallback: QueuedJob) -> QueuedJob {
        match self.broker.get(self.config.queue, id).await {
            Ok(Some(entry)) => entry.data,
            _ => fallback,
        }
    }

    fn spawn_heartbeat(&self, id: JobId) -> DropGuard {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let broker = self.broker.clone();
        let queue = self.config.queue;
        let every = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = broker.heartbeat(queue, &id).await {
                            debug!(queue = %queue, job_id = %id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });
        guard
    }

    async fn sweep_stalled(&self, stats: &Mutex<WorkerStats>) {
        let queue = self.config.queue;
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.stall_interval).unwrap_or_default();
        match self.broker.requeue_stalled(queue, cutoff).await {
            Ok(ids) if !ids.is_empty() => {
                warn!(queue = %queue, count = ids.len(), "requeued stalled jobs");
                update(stats, |s| s.stalled_requeued += ids.len() as u64);
            }
            Ok(_) => {}
            Err(e) => warn!(queue = %queue, error = %e, "stall sweep failed"),
        }
    }

    async fn send(&self, outcome: JobOutcome) {
        let job_id = outcome.job().job_id.clone();
        if self.outcomes.send(outcome).await.is_err() {
            error!(queue = %self.config.queue, job_id = %job_id, "outcome channel closed; outcome dropped");
        }
    }
}

fn update(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}
