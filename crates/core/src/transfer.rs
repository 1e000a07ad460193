//! Transfers and the balances they move.

use serde::{Deserialize, Serialize};

use crate::currency::CurrencyCode;
use crate::error::{DomainError, DomainResult};
use crate::id::{AccountId, IdempotencyKey};

/// A point-to-point movement of `amount` minor units (e.g. cents).
///
/// Only constructible through [`Transfer::new`], so every instance satisfies
/// `amount > 0` and `from != to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    from: AccountId,
    to: AccountId,
    currency: CurrencyCode,
    amount: i64,
    idempotency_key: IdempotencyKey,
}

impl Transfer {
    pub fn new(
        from: AccountId,
        to: AccountId,
        currency: CurrencyCode,
        amount: i64,
        idempotency_key: IdempotencyKey,
    ) -> DomainResult<Self> {
        if amount <= 0 {
            return Err(DomainError::validation("amount must be positive"));
        }
        if from == to {
            return Err(DomainError::invariant("sender and receiver must differ"));
        }
        Ok(Self {
            from,
            to,
            currency,
            amount,
            idempotency_key,
        })
    }

    pub fn from(&self) -> AccountId {
        self.from
    }

    pub fn to(&self) -> AccountId {
        self.to
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.idempotency_key
    }

    /// Account on the given side of the transfer.
    pub fn account(&self, side: AccountSide) -> AccountId {
        match side {
            AccountSide::Sender => self.from,
            AccountSide::Receiver => self.to,
        }
    }
}

/// Which end of a transfer an account sits on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSide {
    Sender,
    Receiver,
}

impl AccountSide {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountSide::Sender => "sender",
            AccountSide::Receiver => "receiver",
        }
    }
}

impl core::fmt::Display for AccountSide {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current funds of one account, as read inside a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub funds: i64,
}

impl AccountBalance {
    pub fn new(account_id: AccountId, funds: i64) -> Self {
        Self { account_id, funds }
    }

    pub fn covers(&self, amount: i64) -> bool {
        self.funds >= amount
    }
}
