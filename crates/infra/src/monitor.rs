//! Queue monitor: periodic depth sampling and the notification expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clipforge_generation::JobKind;

use crate::jobs::{Broker, QueueCounts};
use crate::recovery::{RecoveryError, RecoveryManager, RecoveryReport};
use crate::repo::NotificationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Backlog (waiting + delayed) at which a queue is reported as `Warning`
    pub warning_depth: usize,
    pub critical_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            warning_depth: 50,
            critical_depth: 200,
        }
    }
}

impl MonitorConfig {
    pub fn classify(&self, counts: &QueueCounts) -> DepthStatus {
        let backlog = counts.backlog();
        if backlog >= self.critical_depth {
            DepthStatus::Critical
        } else if backlog >= self.warning_depth {
            DepthStatus::Warning
        } else {
            DepthStatus::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSample {
    pub queue: JobKind,
    pub counts: QueueCounts,
    pub status: DepthStatus,
}

pub struct QueueMonitor {
    broker: Arc<dyn Broker>,
    notifications: Arc<dyn NotificationStore>,
    config: MonitorConfig,
}

impl QueueMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        notifications: Arc<dyn NotificationStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            broker,
            notifications,
            config,
        }
    }

    /// Sample every queue and log its depth at the matching level.
    pub async fn sample(&self) -> Vec<QueueSample> {
        let mut samples = Vec::with_capacity(JobKind::ALL.len());
        for queue in JobKind::ALL {
            let counts = match self.broker.counts(queue).await {
                Ok(counts) => counts,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "failed to read queue counts");
                    continue;
                }
            };
            let status = self.config.classify(&counts);
            match status {
                DepthStatus::Normal => info!(
                    queue = %queue,
                    waiting = counts.waiting,
                    active = counts.active,
                    delayed = counts.delayed,
                    completed = counts.completed,
                    failed = counts.failed,
                    "queue stats"
                ),
                DepthStatus::Warning => warn!(
                    queue = %queue,
                    backlog = counts.backlog(),
                    threshold = self.config.warning_depth,
                    "queue backlog growing"
                ),
                DepthStatus::Critical => error!(
                    queue = %queue,
                    backlog = counts.backlog(),
                    threshold = self.config.critical_depth,
                    "queue backlog critical"
                ),
            }
            samples.push(QueueSample {
                queue,
                counts,
                status,
            });
        }
        samples
    }

    /// Delete expired notifications; returns how many went.
    pub async fn sweep_notifications(&self, now: DateTime<Utc>) -> u64 {
        match self.notifications.delete_expired(now).await {
            Ok(0) => 0,
            Ok(removed) => {
                info!(removed, "expired notifications swept");
                removed
            }
            Err(e) => {
                warn!(error = %e, "notification sweep failed");
                0
            }
        }
    }

    /// Run recovery to completion, then sample and sweep every `interval` until
    /// `shutdown` fires.
    pub async fn start(
        self,
        recovery: &RecoveryManager,
        shutdown: CancellationToken,
    ) -> Result<(RecoveryReport, JoinHandle<()>), RecoveryError> {
        let report = recovery.run().await?;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sample().await;
                        self.sweep_notifications(Utc::now()).await;
                    }
                }
            }
            debug!("queue monitor stopped");
        });
        Ok((report, handle))
    }
}
