//! Job queue: broker, delivery policy, and queue workers.
//!
//! ## Design
//!
//! - One logical queue per job kind, each bound to exactly one processing function
//! - At-most-N deliveries with exponential backoff, retention of finished entries
//! - Workers heartbeat active entries; stalled entries are requeued
//! - Terminal outcomes leave the worker over a channel and are reconciled elsewhere
//!
//! ## Components
//!
//! - `BrokerJob`: a queue entry with its delivery state
//! - `Broker`: the queue transport (in-memory or Redis)
//! - `QueueWorker`: consumes one queue with bounded concurrency

#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(feature = "redis")]
pub use redis_store::RedisBroker;
pub use store::{Broker, BrokerError, InMemoryBroker};
pub use types::{
    BackoffStrategy, BrokerJob, BrokerState, FailOutcome, JobOptions, QueueCounts, RetryPolicy,
};
pub use worker::{JobOutcome, QueueWorker, QueueWorkerHandle, WorkerConfig, WorkerStats};
