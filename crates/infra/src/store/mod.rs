//! Persistence boundary for balances and the transfer journal.
//!
//! A [`Store`] hands out one [`StoreTransaction`] per transfer. The handle is
//! shared (`Arc`) so concurrent balance lookups can run through the same
//! transaction; it must be resolved with exactly one `commit` or `rollback`.
//! Any call after that fails with [`StoreError::Finished`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use smalledger_core::{AccountBalance, AccountId, Transfer};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A transfer with the same idempotency key was already recorded.
    #[error("duplicate transfer: {0}")]
    Duplicate(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The database aborted the transaction (deadlock or serialization
    /// failure). Safe to retry as a new transaction.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("transaction already finished")]
    Finished,

    #[error("query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Arc<dyn StoreTransaction>, StoreError>;
}

#[async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn begin(&self) -> Result<Arc<dyn StoreTransaction>, StoreError> {
        (**self).begin().await
    }
}

#[async_trait]
pub trait StoreTransaction: Send + Sync {
    /// Lock the given accounts for the rest of the transaction, in a fixed
    /// order, so that concurrent transfers over the same accounts queue up
    /// instead of deadlocking. Unknown accounts are skipped; the balance
    /// lookups report them.
    async fn lock_accounts(&self, accounts: &[AccountId]) -> Result<(), StoreError> {
        let _ = accounts;
        Ok(())
    }

    /// Current funds of `account` as seen by this transaction.
    async fn balance(&self, account: &AccountId) -> Result<AccountBalance, StoreError>;

    /// Debit the sender, credit the receiver and record the transfer under
    /// its idempotency key. Returns the sender's balance after the debit.
    async fn apply_transfer(&self, transfer: &Transfer) -> Result<AccountBalance, StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;

    async fn rollback(&self) -> Result<(), StoreError>;
}
