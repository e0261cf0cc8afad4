//! Credit ledger: per-user prepaid balance with atomic debit/credit.
//!
//! The ledger is a stateless service over a [`CreditStore`]; atomicity is the
//! store's job (a conditional update in the database, a lock in memory).

pub mod ledger;
pub mod store;

pub use ledger::{AmountBand, CreditLedger};
pub use store::{CreditEntry, CreditStore, DebitOutcome, InMemoryCreditStore, LedgerError};
