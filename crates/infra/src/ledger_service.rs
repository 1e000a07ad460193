//! Transfer orchestration.
//!
//! `LedgerService` drives one transfer through a fixed pipeline:
//!
//! ```text
//! Transfer
//!   ↓
//! 1. ValidateCurrency   rate lookup (cache → resilient client → provider)
//!   ↓
//! 2. BeginStoreTx       one store transaction per transfer
//!   ↓
//! 3. CheckFunds         lock both accounts in id order, then sender + receiver
//!                       lookups, concurrently, each with a deadline
//!   ↓
//! 4. ApplyTransfer      debit, credit, journal under the idempotency key
//!   ↓
//! 5. Commit | Rollback
//! ```
//!
//! Every exit after step 2 resolves the transaction: failures roll back (a
//! failed rollback is logged, the original error is returned) and a failed
//! commit is reported as-is, never retried.
//!
//! This module contains no IO itself; it composes the store, rate lookup and
//! fan-out boundaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use smalledger_core::{AccountBalance, AccountId, AccountSide, CurrencyCode, IdempotencyKey, Transfer};

use crate::fanout::{FanoutError, FanoutExecutor, FanoutTask};
use crate::rates::{RateError, RateLookup};
use crate::store::{Store, StoreError, StoreTransaction};

pub const DEFAULT_FUNDS_CHECK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Whether a failure was caused by the request or by the system serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Server,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("currency validation failed: {0}")]
    Currency(#[source] RateError),

    #[error("could not open store transaction: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("{side} account not found")]
    AccountNotFound { side: AccountSide },

    #[error("{side} balance lookup failed: {reason}")]
    FundsCheckFailed { side: AccountSide, reason: String },

    #[error("{side} balance lookup timed out")]
    FundsCheckTimeout { side: AccountSide },

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("transfer {0} was already processed")]
    DuplicateTransfer(IdempotencyKey),

    #[error("applying transfer failed: {0}")]
    ApplyFailed(#[source] StoreError),

    #[error("commit failed: {0}")]
    CommitFailed(#[source] StoreError),

    /// The store aborted the transaction because of a concurrent transfer.
    #[error("transfer conflicted with a concurrent transfer: {0}")]
    Conflict(#[source] StoreError),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::AccountNotFound { .. }
            | TransferError::InsufficientFunds { .. }
            | TransferError::DuplicateTransfer(_) => ErrorKind::Client,
            _ => ErrorKind::Server,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.kind() == ErrorKind::Client
    }
}

/// Outcome of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub idempotency_key: IdempotencyKey,
    pub from: AccountId,
    pub to: AccountId,
    pub currency: CurrencyCode,
    pub amount: i64,
    /// Sender funds after the debit.
    pub sender_balance: i64,
    pub committed_at: DateTime<Utc>,
}

pub struct LedgerDeps {
    pub store: Arc<dyn Store>,
    pub rates: Arc<dyn RateLookup>,
    pub fanout: FanoutExecutor,
    pub funds_check_timeout: Duration,
}

pub struct LedgerService {
    store: Arc<dyn Store>,
    rates: Arc<dyn RateLookup>,
    fanout: FanoutExecutor,
}

impl LedgerService {
    pub fn new(deps: LedgerDeps) -> Self {
        Self {
            store: deps.store,
            rates: deps.rates,
            fanout: deps.fanout.with_deadline(deps.funds_check_timeout),
        }
    }

    #[instrument(
        name = "process_transfer",
        skip(self, transfer, cancel),
        fields(
            idempotency_key = %transfer.idempotency_key(),
            from = %transfer.from(),
            to = %transfer.to(),
            currency = %transfer.currency(),
            amount = transfer.amount()
        )
    )]
    pub async fn process_transfer(
        &self,
        transfer: Transfer,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        self.rates
            .get_rates(transfer.currency(), cancel)
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    TransferError::Cancelled
                } else {
                    warn!(error = %e, "currency validation failed");
                    TransferError::Currency(e)
                }
            })?;
        info!("currency validated");

        let tx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            begun = self.store.begin() => begun.map_err(|e| {
                warn!(error = %e, "could not open store transaction");
                TransferError::StoreUnavailable(e)
            })?,
        };

        let sender_balance = match self.debit_and_credit(&tx, &transfer, cancel).await {
            Ok(balance) => balance,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                info!(error = %err, "transfer rolled back");
                return Err(err);
            }
        };

        tx.commit().await.map_err(|e| match e {
            StoreError::Duplicate(_) => TransferError::DuplicateTransfer(transfer.idempotency_key()),
            StoreError::Conflict(_) => TransferError::Conflict(e),
            other => {
                warn!(error = %other, "commit failed");
                TransferError::CommitFailed(other)
            }
        })?;
        info!(sender_balance = sender_balance.funds, "transfer committed");

        Ok(TransferReceipt {
            idempotency_key: transfer.idempotency_key(),
            from: transfer.from(),
            to: transfer.to(),
            currency: transfer.currency().clone(),
            amount: transfer.amount(),
            sender_balance: sender_balance.funds,
            committed_at: Utc::now(),
        })
    }

    async fn debit_and_credit(
        &self,
        tx: &Arc<dyn StoreTransaction>,
        transfer: &Transfer,
        cancel: &CancellationToken,
    ) -> Result<AccountBalance, TransferError> {
        let accounts = [transfer.from(), transfer.to()];
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            locked = tx.lock_accounts(&accounts) => locked.map_err(|e| match e {
                StoreError::Conflict(_) => TransferError::Conflict(e),
                other => TransferError::FundsCheckFailed {
                    side: AccountSide::Sender,
                    reason: other.to_string(),
                },
            })?,
        }

        let sender = self.check_funds(tx, transfer, cancel).await?;
        if !sender.covers(transfer.amount()) {
            return Err(TransferError::InsufficientFunds {
                available: sender.funds,
                requested: transfer.amount(),
            });
        }
        info!(available = sender.funds, "funds checked");

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        tx.apply_transfer(transfer).await.map_err(|e| match e {
            StoreError::Duplicate(_) => TransferError::DuplicateTransfer(transfer.idempotency_key()),
            StoreError::NotFound(id) if id == transfer.from() => TransferError::AccountNotFound {
                side: AccountSide::Sender,
            },
            StoreError::NotFound(_) => TransferError::AccountNotFound {
                side: AccountSide::Receiver,
            },
            StoreError::Conflict(_) => TransferError::Conflict(e),
            other => TransferError::ApplyFailed(other),
        })
    }

    /// Look up both balances concurrently. Returns the sender's balance; the
    /// receiver lookup only proves the account exists. The first failure to
    /// arrive wins and aborts the other lookup.
    async fn check_funds(
        &self,
        tx: &Arc<dyn StoreTransaction>,
        transfer: &Transfer,
        cancel: &CancellationToken,
    ) -> Result<AccountBalance, TransferError> {
        let scope = cancel.child_token();
        let _abort_on_exit = scope.clone().drop_guard();

        let tasks = [AccountSide::Sender, AccountSide::Receiver]
            .into_iter()
            .map(|side| {
                let tx = Arc::clone(tx);
                let account = transfer.account(side);
                FanoutTask::new(side.as_str(), move |_cancel| async move {
                    tx.balance(&account).await
                })
            })
            .collect();

        let mut stream = self.fanout.run_all(tasks, &scope);
        let mut sender = None;

        while let Some(output) = stream.recv().await {
            let side = if output.name == AccountSide::Sender.as_str() {
                AccountSide::Sender
            } else {
                AccountSide::Receiver
            };

            match output.result {
                Ok(balance) => {
                    if side == AccountSide::Sender {
                        sender = Some(balance);
                    }
                }
                Err(err) => return Err(funds_check_error(side, err, cancel)),
            }
        }

        sender.ok_or_else(|| TransferError::FundsCheckFailed {
            side: AccountSide::Sender,
            reason: "no result".to_string(),
        })
    }
}

fn funds_check_error(
    side: AccountSide,
    err: FanoutError<StoreError>,
    cancel: &CancellationToken,
) -> TransferError {
    match err {
        FanoutError::Failed(StoreError::NotFound(_)) => TransferError::AccountNotFound { side },
        FanoutError::Failed(e @ StoreError::Conflict(_)) => TransferError::Conflict(e),
        FanoutError::Failed(other) => TransferError::FundsCheckFailed {
            side,
            reason: other.to_string(),
        },
        FanoutError::DeadlineExceeded => TransferError::FundsCheckTimeout { side },
        FanoutError::Cancelled if cancel.is_cancelled() => TransferError::Cancelled,
        FanoutError::Cancelled => TransferError::FundsCheckFailed {
            side,
            reason: "lookup cancelled".to_string(),
        },
        FanoutError::Panicked(msg) => TransferError::FundsCheckFailed {
            side,
            reason: format!("lookup panicked: {msg}"),
        },
    }
}
