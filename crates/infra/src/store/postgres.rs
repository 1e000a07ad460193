//! Postgres-backed store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check violation) | `23514` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (deadlock / serialization failure) | `40P01` / `40001` | `Conflict` |
//! | Database (other) | any other | `Query` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Query` |
//!
//! ## Locking
//!
//! `lock_accounts` takes row locks on both accounts in one statement ordered
//! by id, so two transfers over the same pair always lock in the same order.
//! The rows stay locked until commit or rollback; the balance reads that
//! follow are plain `SELECT`s. The sqlx transaction sits behind an async
//! mutex: concurrent lookups through one handle serialize on its single
//! connection but observe the same snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Uuid;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::instrument;

use smalledger_core::{AccountBalance, AccountId, Transfer};

use super::{Store, StoreError, StoreTransaction};

const SCHEMA: &str = include_str!("../../migrations/0001_accounts_and_transfers.sql");

const LOCK_ACCOUNTS: &str = "SELECT id FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `accounts` and `transfers` tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Arc<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Arc::new(PostgresTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct PostgresTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self), err)]
    async fn lock_accounts(&self, accounts: &[AccountId]) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::Finished)?;

        let ids: Vec<Uuid> = accounts.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query(LOCK_ACCOUNTS)
            .bind(ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_accounts", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %account), err)]
    async fn balance(&self, account: &AccountId) -> Result<AccountBalance, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::Finished)?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT funds FROM accounts WHERE id = $1")
                .bind(account.as_uuid())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("balance", e))?;

        let (funds,) = row.ok_or(StoreError::NotFound(*account))?;
        Ok(AccountBalance::new(*account, funds))
    }

    #[instrument(
        skip(self, transfer),
        fields(
            idempotency_key = %transfer.idempotency_key(),
            amount = transfer.amount()
        ),
        err
    )]
    async fn apply_transfer(&self, transfer: &Transfer) -> Result<AccountBalance, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::Finished)?;

        // Journal first: a replayed key fails before any balance moves.
        sqlx::query(
            r#"
            INSERT INTO transfers (idempotency_key, from_account, to_account, currency, amount)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(transfer.idempotency_key().as_uuid())
        .bind(transfer.from().as_uuid())
        .bind(transfer.to().as_uuid())
        .bind(transfer.currency().as_str())
        .bind(transfer.amount())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record_transfer", e))?;

        let debited: Option<(i64,)> =
            sqlx::query_as("UPDATE accounts SET funds = funds - $2 WHERE id = $1 RETURNING funds")
                .bind(transfer.from().as_uuid())
                .bind(transfer.amount())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("debit", e))?;
        let (remaining,) = debited.ok_or(StoreError::NotFound(transfer.from()))?;

        let credited = sqlx::query("UPDATE accounts SET funds = funds + $2 WHERE id = $1")
            .bind(transfer.to().as_uuid())
            .bind(transfer.amount())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("credit", e))?;
        if credited.rows_affected() == 0 {
            return Err(StoreError::NotFound(transfer.to()));
        }

        Ok(AccountBalance::new(transfer.from(), remaining))
    }

    #[instrument(skip(self), err)]
    async fn commit(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::Finished)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), err)]
    async fn rollback(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::Finished)?;
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            classify_sqlstate(db_err.code().as_deref(), msg)
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        _ => StoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}

fn classify_sqlstate(code: Option<&str>, msg: String) -> StoreError {
    match code {
        Some("23505") => StoreError::Duplicate(msg),
        Some("23514") | Some("23503") => StoreError::Constraint(msg),
        Some("40P01") | Some("40001") => StoreError::Conflict(msg),
        _ => StoreError::Query(msg),
    }
}
