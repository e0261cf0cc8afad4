//! Recovery manager.
//!
//! Runs once per process start, before the workers and the HTTP surface come up.
//! Anything still in flight at that point belongs to a process that died, so it is
//! failed through the live failure path (refund, record, notification) and tagged
//! with the restart marker before being removed from the broker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use clipforge_core::JobId;
use clipforge_generation::{JobKind, JobStatus, QueuedJob};

use crate::jobs::{Broker, BrokerError, BrokerState};
use crate::outcome::{FailureHandling, OutcomeHandler};
use crate::repo::{JobRepository, RepositoryError};

const IN_FLIGHT: [BrokerState; 3] = [
    BrokerState::Active,
    BrokerState::Waiting,
    BrokerState::Delayed,
];

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Broker entries failed and refunded.
    pub broker_reconciled: usize,
    /// `processing` jobs with no live broker entry, failed and refunded.
    pub orphans_reconciled: usize,
    /// `pending` jobs with no broker entry; left untouched.
    pub pending_orphans: usize,
    /// Entries that could not be removed from the broker after reconciliation.
    pub removal_failures: usize,
}

pub struct RecoveryManager {
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobRepository>,
    outcomes: OutcomeHandler,
}

impl RecoveryManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobRepository>,
        outcomes: OutcomeHandler,
    ) -> Self {
        Self {
            broker,
            jobs,
            outcomes,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();

        for queue in JobKind::ALL {
            self.recover_queue(queue, &mut report).await?;
        }
        self.recover_orphans(&mut report).await?;

        info!(
            broker_reconciled = report.broker_reconciled,
            orphans_reconciled = report.orphans_reconciled,
            pending_orphans = report.pending_orphans,
            removal_failures = report.removal_failures,
            "recovery finished"
        );
        Ok(report)
    }

    async fn recover_queue(
        &self,
        queue: JobKind,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let entries = self.broker.jobs_in_states(queue, &IN_FLIGHT).await?;
        if entries.is_empty() {
            return Ok(());
        }
        info!(queue = %queue, count = entries.len(), "reconciling interrupted jobs");

        for entry in entries {
            let mut data = entry.data.clone();
            data.restart_reconciled = true;

            // Tag first: a late failure callback for this entry must see the marker.
            if let Err(e) = self
                .broker
                .update_data(queue, &entry.id, data.clone())
                .await
            {
                warn!(queue = %queue, job_id = %entry.id, error = %e, "failed to tag entry");
            }

            if let FailureHandling::Reconciled { .. } =
                self.outcomes.reconcile_interrupted(&data).await
            {
                report.broker_reconciled += 1;
            }

            if let Err(e) = self.broker.remove(queue, &entry.id).await {
                report.removal_failures += 1;
                warn!(
                    queue = %queue,
                    job_id = %entry.id,
                    error = %e,
                    "failed to remove reconciled entry; left tagged"
                );
            }
        }
        Ok(())
    }

    /// Ids waiting, delayed or active in each queue. A queue that cannot be listed
    /// maps to `None` and everything in it counts as live.
    async fn live_entries(&self) -> HashMap<JobKind, Option<HashSet<JobId>>> {
        let mut live = HashMap::new();
        for queue in JobKind::ALL {
            let ids = match self.broker.jobs_in_states(queue, &IN_FLIGHT).await {
                Ok(entries) => Some(entries.into_iter().map(|entry| entry.id).collect()),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "broker listing failed; assuming live");
                    None
                }
            };
            live.insert(queue, ids);
        }
        live
    }

    async fn recover_orphans(&self, report: &mut RecoveryReport) -> Result<(), RecoveryError> {
        let live = self.live_entries().await;
        let has_live_entry = |kind: JobKind, id: &JobId| match live.get(&kind) {
            Some(Some(ids)) => ids.contains(id),
            _ => true,
        };

        for job in self.jobs.list_by_status(JobStatus::Processing).await? {
            if has_live_entry(job.kind(), &job.job_id) {
                continue;
            }
            let queued = QueuedJob::from_job(&job);
            if let FailureHandling::Reconciled { .. } =
                self.outcomes.reconcile_interrupted(&queued).await
            {
                report.orphans_reconciled += 1;
            }
        }

        for job in self.jobs.list_by_status(JobStatus::Pending).await? {
            if has_live_entry(job.kind(), &job.job_id) {
                continue;
            }
            report.pending_orphans += 1;
            warn!(
                job_id = %job.job_id,
                user_id = %job.user_id,
                cost = job.cost,
                "pending job has no broker entry; debited but never queued"
            );
        }
        Ok(())
    }
}
