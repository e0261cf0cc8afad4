//! Broker entry types and delivery policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clipforge_core::JobId;
use clipforge_generation::{JobKind, QueuedJob};

/// Backoff strategy for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Delivery-attempt policy.
///
/// `max_attempts` counts deliveries, so `1` means a failure is immediately terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of deliveries (at least 1)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single delivery, no redelivery on failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before redelivery after `attempt` failed deliveries (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another delivery is allowed after `attempts_made` deliveries.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Options attached to an entry at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub retry: RetryPolicy,
    /// Finished entries kept per queue before the oldest are dropped.
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            keep_completed: 100,
            keep_failed: 200,
        }
    }
}

/// Broker-side state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Waiting,
    Active,
    /// Failed a delivery, waiting out its backoff.
    Delayed,
    Completed,
    Failed,
}

impl BrokerState {
    pub fn is_finished(&self) -> bool {
        matches!(self, BrokerState::Completed | BrokerState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Waiting => "waiting",
            BrokerState::Active => "active",
            BrokerState::Delayed => "delayed",
            BrokerState::Completed => "completed",
            BrokerState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(BrokerState::Waiting),
            "active" => Some(BrokerState::Active),
            "delayed" => Some(BrokerState::Delayed),
            "completed" => Some(BrokerState::Completed),
            "failed" => Some(BrokerState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry in one of the broker queues, keyed by the job's `jobId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJob {
    pub id: JobId,
    pub queue: JobKind,
    pub data: QueuedJob,
    pub options: JobOptions,
    pub state: BrokerState,
    /// Deliveries so far (incremented on reserve).
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest redelivery time while `Delayed`.
    pub available_at: Option<DateTime<Utc>>,
    /// Last worker heartbeat while `Active`.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl BrokerJob {
    pub fn new(queue: JobKind, data: QueuedJob, options: JobOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: data.job_id.clone(),
            queue,
            data,
            options,
            state: BrokerState::Waiting,
            attempts_made: 0,
            enqueued_at: now,
            updated_at: now,
            available_at: None,
            heartbeat_at: None,
            failed_reason: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BrokerState::Waiting => true,
            BrokerState::Delayed => self.available_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = BrokerState::Active;
        self.attempts_made += 1;
        self.available_at = None;
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = BrokerState::Completed;
        self.heartbeat_at = None;
        self.failed_reason = None;
        self.updated_at = now;
    }

    /// Record a failed delivery; returns the outcome the broker reports upstream.
    pub fn mark_failed(&mut self, reason: &str, retryable: bool, now: DateTime<Utc>) -> FailOutcome {
        self.failed_reason = Some(reason.to_string());
        self.heartbeat_at = None;
        self.updated_at = now;

        if retryable && self.options.retry.should_retry(self.attempts_made) {
            let delay = self.options.retry.delay_for_attempt(self.attempts_made);
            self.state = BrokerState::Delayed;
            self.available_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            FailOutcome::Retrying {
                attempt: self.attempts_made,
                delay,
            }
        } else {
            self.state = BrokerState::Failed;
            self.available_at = None;
            FailOutcome::Failed {
                attempts: self.attempts_made,
            }
        }
    }

    /// Put a stalled active entry back in line.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) {
        self.state = BrokerState::Waiting;
        self.heartbeat_at = None;
        self.updated_at = now;
    }
}

/// What the broker decided after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivery scheduled after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal: the failure hook must run.
    Failed { attempts: u32 },
}

/// Entry counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Entries not yet picked up.
    pub fn backlog(&self) -> usize {
        self.waiting + self.delayed
    }

    pub(crate) fn bump(&mut self, state: BrokerState) {
        match state {
            BrokerState::Waiting => self.waiting += 1,
            BrokerState::Active => self.active += 1,
            BrokerState::Delayed => self.delayed += 1,
            BrokerState::Completed => self.completed += 1,
            BrokerState::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipforge_core::{RecordId, UserId};
    use clipforge_generation::{EffectRequest, JobPayload};

    fn entry(options: JobOptions) -> BrokerJob {
        let data = QueuedJob {
            job_id: JobId::generate(),
            user_id: UserId::new(),
            record_id: RecordId::new(),
            payload: JobPayload::Effect(EffectRequest {
                effect_id: "effects/zoom".to_string(),
                image_url: "https://img.test/a.png".to_string(),
                prompt: None,
            }),
            restart_reconciled: false,
        };
        BrokerJob::new(JobKind::Effect, data, options, Utc::now())
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn retryable_failure_is_delayed_until_attempts_run_out() {
        let mut job = entry(JobOptions {
            retry: RetryPolicy::fixed(2, Duration::from_millis(50)),
            ..Default::default()
        });

        job.mark_active(Utc::now());
        let first = job.mark_failed("rate limited", true, Utc::now());
        assert!(matches!(first, FailOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(job.state, BrokerState::Delayed);
        assert!(job.available_at.is_some());

        job.mark_active(Utc::now());
        let second = job.mark_failed("rate limited", true, Utc::now());
        assert_eq!(second, FailOutcome::Failed { attempts: 2 });
        assert_eq!(job.state, BrokerState::Failed);
    }

    #[test]
    fn non_retryable_failure_is_terminal_immediately() {
        let mut job = entry(JobOptions {
            retry: RetryPolicy::fixed(5, Duration::from_millis(50)),
            ..Default::default()
        });

        job.mark_active(Utc::now());
        let outcome = job.mark_failed("bad input", false, Utc::now());
        assert_eq!(outcome, FailOutcome::Failed { attempts: 1 });
    }

    #[test]
    fn stored_state_names_parse_back() {
        for state in [
            BrokerState::Waiting,
            BrokerState::Active,
            BrokerState::Delayed,
            BrokerState::Completed,
            BrokerState::Failed,
        ] {
            assert_eq!(BrokerState::parse(state.as_str()), Some(state));
        }
        assert_eq!(BrokerState::parse("stalled"), None);
    }

    proptest::proptest! {
        /// Exponential delays stay within the cap plus jitter and never drop far below the base.
        #[test]
        fn exponential_delay_is_bounded(
            base_ms in 1u64..=10_000,
            cap_factor in 1u64..=64,
            attempt in 1u32..=20,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(base_ms * cap_factor);
            let policy = RetryPolicy::exponential(5, base, max);

            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            proptest::prop_assert!(delay <= max.as_millis() as f64 * 1.1 + 1.0);
            proptest::prop_assert!(delay + 1.0 >= base_ms as f64 * 0.9);
        }

        #[test]
        fn retries_stop_at_max_attempts(max_attempts in 1u32..=10, made in 0u32..=12) {
            let policy = RetryPolicy::fixed(max_attempts, Duration::ZERO);
            proptest::prop_assert_eq!(policy.should_retry(made), made < max_attempts);
        }
    }
}
