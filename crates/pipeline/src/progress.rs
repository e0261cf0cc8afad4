//! Timer-driven progress reporting.
//!
//! Providers expose no granular progress, so a job's progress is a fixed-cadence
//! curve that rises monotonically toward 99%. 100% is only ever emitted by the
//! completion handler after the result has been persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use clipforge_core::{JobId, UserId};
use clipforge_events::{QueueEvent, RealtimeChannel, user_channel};
use clipforge_generation::JobKind;

/// Ceiling while the job is still running.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Next value on the progress curve: big steps early, smaller near the ceiling,
/// never exceeding [`MAX_RUNNING_PROGRESS`].
pub fn next_progress(current: u8) -> u8 {
    if current >= MAX_RUNNING_PROGRESS {
        return MAX_RUNNING_PROGRESS;
    }
    let step = ((MAX_RUNNING_PROGRESS - current) / 8).max(1);
    (current + step).min(MAX_RUNNING_PROGRESS)
}

/// Background progress ticker owned by one job execution.
///
/// Dropping the ticker cancels it; [`ProgressTicker::stop`] also waits for the task
/// and returns the last value emitted.
#[derive(Debug)]
pub struct ProgressTicker {
    guard: DropGuard,
    handle: JoinHandle<u8>,
}

impl ProgressTicker {
    pub fn spawn(
        realtime: Arc<dyn RealtimeChannel>,
        job_id: JobId,
        user_id: UserId,
        kind: JobKind,
        every: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let channel = user_channel(user_id);
            let mut progress: u8 = 0;

            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        progress = next_progress(progress);
                        let event = QueueEvent::progress(job_id.clone(), kind, progress);
                        realtime.emit(&channel, event.event_name(), event.to_payload());
                    }
                }
            }

            debug!(job_id = %job_id, progress, "progress ticker stopped");
            progress
        });

        Self {
            guard: token.drop_guard(),
            handle,
        }
    }

    /// Cancel and wait for the ticker; returns the last emitted progress.
    pub async fn stop(self) -> u8 {
        let ProgressTicker { guard, handle } = self;
        drop(guard);
        handle.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipforge_events::InMemoryRealtimeHub;

    #[test]
    fn progress_curve_is_monotonic_and_capped() {
        let mut p = 0u8;
        let mut seen = vec![p];
        for _ in 0..200 {
            let next = next_progress(p);
            assert!(next >= p);
            assert!(next <= MAX_RUNNING_PROGRESS);
            p = next;
            seen.push(p);
        }
        assert_eq!(p, MAX_RUNNING_PROGRESS);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn ticker_emits_until_stopped() {
        let hub = Arc::new(InMemoryRealtimeHub::new());
        let user = UserId::new();
        let mut sub = hub.subscribe(user_channel(user));

        let ticker = ProgressTicker::spawn(
            hub.clone(),
            JobId::generate(),
            user,
            JobKind::Effect,
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        let last = ticker.stop().await;

        let events = sub.drain();
        assert!(!events.is_empty());
        assert!(events.iter().all(|m| m.event == "job:progress"));

        let values: Vec<u64> = events
            .iter()
            .map(|m| m.payload["progress"].as_u64().unwrap())
            .collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*values.last().unwrap(), last as u64);
        assert!(last < 100);

        // Nothing after stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.drain().is_empty());
    }
}
