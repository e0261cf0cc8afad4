//! Infrastructure layer: broker, workers, persistence, reconciliation, config.
//!
//! - `jobs`: broker port (in-memory + Redis) and queue workers
//! - `repo`: job / record / notification repositories (in-memory + Postgres)
//! - `outcome`: applies worker outcomes to persisted state (refunds, notifications)
//! - `recovery`: startup reconciliation of jobs interrupted by a crash
//! - `monitor`: periodic queue stats and notification expiry
//! - `notifications`: notification fan-out (realtime, persisted, device push)
//! - `service`: `submit` / `retry`
//! - `config`: environment configuration

use std::sync::Arc;

use clipforge_ledger::{CreditLedger, CreditStore};

pub mod config;
pub mod jobs;
pub mod monitor;
pub mod notifications;
pub mod outcome;
pub mod recovery;
pub mod repo;
pub mod service;

#[cfg(test)]
mod integration_tests;

/// Ledger over a type-erased credit store, shared by submission and reconciliation.
pub type Ledger = CreditLedger<Arc<dyn CreditStore>>;
