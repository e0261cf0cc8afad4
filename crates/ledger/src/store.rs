//! Credit storage port and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use clipforge_core::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Programming/data error: the amount is outside the configured sanity band.
    #[error("credit amount {amount} outside [{min}, {max}]")]
    AmountOutOfRange { amount: i64, min: i64, max: i64 },

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("credit storage error: {0}")]
    Storage(String),
}

/// Result of an atomic conditional debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited { balance: i64 },
    Insufficient { balance: i64 },
}

/// One balance movement (positive = credit, negative = debit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub user_id: UserId,
    pub delta: i64,
    pub balance_after: i64,
    pub at: DateTime<Utc>,
}

/// Balance storage.
///
/// `try_debit` and `credit` must be atomic read-modify-writes; the ledger holds no
/// application-level lock.
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError>;

    /// Subtract `amount` only if the balance covers it.
    async fn try_debit(&self, user_id: UserId, amount: i64) -> Result<DebitOutcome, LedgerError>;

    /// Add `amount`, returning the new balance.
    async fn credit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError>;
}

#[async_trait]
impl<S> CreditStore for Arc<S>
where
    S: CreditStore + ?Sized,
{
    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        (**self).balance(user_id).await
    }

    async fn try_debit(&self, user_id: UserId, amount: i64) -> Result<DebitOutcome, LedgerError> {
        (**self).try_debit(user_id, amount).await
    }

    async fn credit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        (**self).credit(user_id, amount).await
    }
}

/// In-memory credit store for tests/dev.
///
/// Keeps a journal of every movement so tests can check debit/refund pairing.
#[derive(Debug, Default)]
pub struct InMemoryCreditStore {
    inner: Mutex<InMemoryCredits>,
}

#[derive(Debug, Default)]
struct InMemoryCredits {
    balances: HashMap<UserId, i64>,
    journal: Vec<CreditEntry>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register (or overwrite) a user's balance.
    pub fn set_balance(&self, user_id: UserId, balance: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.balances.insert(user_id, balance);
        }
    }

    pub fn journal(&self, user_id: UserId) -> Vec<CreditEntry> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .journal
                    .iter()
                    .filter(|e| e.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryCredits>, LedgerError> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Storage("credit store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let inner = self.lock()?;
        inner
            .balances
            .get(&user_id)
            .copied()
            .ok_or(LedgerError::UnknownUser(user_id))
    }

    async fn try_debit(&self, user_id: UserId, amount: i64) -> Result<DebitOutcome, LedgerError> {
        let mut inner = self.lock()?;
        let balance = *inner
            .balances
            .get(&user_id)
            .ok_or(LedgerError::UnknownUser(user_id))?;

        if balance < amount {
            return Ok(DebitOutcome::Insufficient { balance });
        }

        let balance_after = balance - amount;
        inner.balances.insert(user_id, balance_after);
        inner.journal.push(CreditEntry {
            user_id,
            delta: -amount,
            balance_after,
            at: Utc::now(),
        });
        Ok(DebitOutcome::Debited {
            balance: balance_after,
        })
    }

    async fn credit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        let mut inner = self.lock()?;
        let balance = inner
            .balances
            .get_mut(&user_id)
            .ok_or(LedgerError::UnknownUser(user_id))?;
        *balance += amount;
        let balance_after = *balance;
        inner.journal.push(CreditEntry {
            user_id,
            delta: amount,
            balance_after,
            at: Utc::now(),
        });
        Ok(balance_after)
    }
}
