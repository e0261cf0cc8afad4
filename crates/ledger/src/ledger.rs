use tracing::{debug, warn};

use clipforge_core::UserId;

use crate::store::{CreditStore, DebitOutcome, LedgerError};

/// Sanity band for a single debit/credit amount (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBand {
    pub min: i64,
    pub max: i64,
}

impl AmountBand {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn check(&self, amount: i64) -> Result<(), LedgerError> {
        if amount < self.min || amount > self.max {
            return Err(LedgerError::AmountOutOfRange {
                amount,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for AmountBand {
    fn default() -> Self {
        Self { min: 1, max: 10_000 }
    }
}

/// Credit ledger service.
///
/// Debits happen before enqueue; every terminal failure after a debit is matched by
/// exactly one `add_credits` of the same amount (the caller enforces the "exactly").
#[derive(Debug, Clone)]
pub struct CreditLedger<S> {
    store: S,
    band: AmountBand,
}

impl<S> CreditLedger<S>
where
    S: CreditStore,
{
    pub fn new(store: S, band: AmountBand) -> Self {
        Self { store, band }
    }

    pub fn band(&self) -> AmountBand {
        self.band
    }

    /// Atomically debit `amount` if the balance covers it.
    pub async fn deduct(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        self.band.check(amount)?;
        match self.store.try_debit(user_id, amount).await? {
            DebitOutcome::Debited { balance } => {
                debug!(%user_id, amount, balance, "credits deducted");
                Ok(balance)
            }
            DebitOutcome::Insufficient { balance } => {
                Err(LedgerError::InsufficientCredits {
                    balance,
                    required: amount,
                })
            }
        }
    }

    /// Credit `amount` back to the user (refund or top-up).
    pub async fn add_credits(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        self.band.check(amount)?;
        match self.store.credit(user_id, amount).await {
            Ok(balance) => {
                debug!(%user_id, amount, balance, "credits added");
                Ok(balance)
            }
            Err(e) => {
                warn!(%user_id, amount, error = %e, "credit failed");
                Err(e)
            }
        }
    }

    pub async fn get_credits(&self, user_id: UserId) -> Result<i64, LedgerError> {
        self.store.balance(user_id).await
    }

    /// Advisory pre-check. `deduct` remains the authority under concurrency.
    pub async fn has_sufficient(&self, user_id: UserId, amount: i64) -> Result<bool, LedgerError> {
        Ok(self.store.balance(user_id).await? >= amount)
    }
}
