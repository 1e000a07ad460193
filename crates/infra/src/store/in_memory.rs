use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use smalledger_core::{AccountBalance, AccountId, IdempotencyKey, Transfer};

use super::{Store, StoreError, StoreTransaction};

#[derive(Debug, Default)]
struct Ledger {
    accounts: HashMap<AccountId, i64>,
    journal: HashSet<IdempotencyKey>,
}

#[derive(Debug, Default)]
struct Shared {
    ledger: RwLock<Ledger>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// In-memory store.
///
/// Intended for tests/dev. Transactions stage their writes and apply them
/// under one write lock on commit, re-checking the idempotency key and the
/// non-negative funds constraint at that point.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) an account with the given funds.
    pub fn open_account(&self, id: AccountId, funds: i64) {
        if let Ok(mut ledger) = self.shared.ledger.write() {
            ledger.accounts.insert(id, funds);
        }
    }

    /// Committed funds of `id`, if the account exists.
    pub fn balance_of(&self, id: &AccountId) -> Option<i64> {
        self.shared
            .ledger
            .read()
            .ok()
            .and_then(|ledger| ledger.accounts.get(id).copied())
    }

    pub fn has_transfer(&self, key: &IdempotencyKey) -> bool {
        self.shared
            .ledger
            .read()
            .map(|ledger| ledger.journal.contains(key))
            .unwrap_or(false)
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Arc<dyn StoreTransaction>, StoreError> {
        Ok(Arc::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: Mutex::new(Staged::default()),
            finished: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Default)]
struct Staged {
    deltas: HashMap<AccountId, i64>,
    keys: Vec<IdempotencyKey>,
}

#[derive(Debug)]
struct InMemoryTransaction {
    shared: Arc<Shared>,
    staged: Mutex<Staged>,
    finished: AtomicBool,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

fn overflow(id: &AccountId) -> StoreError {
    StoreError::Constraint(format!("funds of account {id} would overflow"))
}

fn negative(id: &AccountId) -> StoreError {
    StoreError::Constraint(format!("funds of account {id} would become negative"))
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished.load(Ordering::SeqCst) {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    fn finish(&self) -> Result<(), StoreError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    fn current_funds(&self, ledger: &Ledger, staged: &Staged, id: &AccountId) -> Result<i64, StoreError> {
        let committed = ledger.accounts.get(id).copied().ok_or(StoreError::NotFound(*id))?;
        committed
            .checked_add(staged.deltas.get(id).copied().unwrap_or(0))
            .ok_or_else(|| overflow(id))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn balance(&self, account: &AccountId) -> Result<AccountBalance, StoreError> {
        self.ensure_open()?;
        let ledger = self.shared.ledger.read().map_err(|_| poisoned())?;
        let staged = self.staged.lock().map_err(|_| poisoned())?;
        let funds = self.current_funds(&ledger, &staged, account)?;
        Ok(AccountBalance::new(*account, funds))
    }

    async fn apply_transfer(&self, transfer: &Transfer) -> Result<AccountBalance, StoreError> {
        self.ensure_open()?;
        let ledger = self.shared.ledger.read().map_err(|_| poisoned())?;
        let mut staged = self.staged.lock().map_err(|_| poisoned())?;

        let key = transfer.idempotency_key();
        if ledger.journal.contains(&key) || staged.keys.contains(&key) {
            return Err(StoreError::Duplicate(key.to_string()));
        }

        let (from, to, amount) = (transfer.from(), transfer.to(), transfer.amount());
        let sender = self.current_funds(&ledger, &staged, &from)?;
        let receiver = self.current_funds(&ledger, &staged, &to)?;

        let remaining = sender.checked_sub(amount).ok_or_else(|| overflow(&from))?;
        if remaining < 0 {
            return Err(negative(&from));
        }
        receiver.checked_add(amount).ok_or_else(|| overflow(&to))?;

        let from_delta = staged.deltas.get(&from).copied().unwrap_or(0);
        let to_delta = staged.deltas.get(&to).copied().unwrap_or(0);
        let from_delta = from_delta.checked_sub(amount).ok_or_else(|| overflow(&from))?;
        let to_delta = to_delta.checked_add(amount).ok_or_else(|| overflow(&to))?;

        staged.deltas.insert(from, from_delta);
        staged.deltas.insert(to, to_delta);
        staged.keys.push(key);

        Ok(AccountBalance::new(transfer.from(), remaining))
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.finish()?;
        let staged = std::mem::take(&mut *self.staged.lock().map_err(|_| poisoned())?);
        let mut ledger = self.shared.ledger.write().map_err(|_| poisoned())?;

        if let Some(key) = staged.keys.iter().find(|k| ledger.journal.contains(*k)) {
            return Err(StoreError::Duplicate(key.to_string()));
        }

        let mut updated = Vec::with_capacity(staged.deltas.len());
        for (id, delta) in &staged.deltas {
            let committed = ledger.accounts.get(id).copied().ok_or(StoreError::NotFound(*id))?;
            let funds = committed.checked_add(*delta).ok_or_else(|| overflow(id))?;
            if funds < 0 {
                return Err(negative(id));
            }
            updated.push((*id, funds));
        }

        ledger.accounts.extend(updated);
        ledger.journal.extend(staged.keys);
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.finish()?;
        if let Ok(mut staged) = self.staged.lock() {
            *staged = Staged::default();
        }
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smalledger_core::CurrencyCode;

    fn transfer(from: AccountId, to: AccountId, amount: i64, key: IdempotencyKey) -> Transfer {
        Transfer::new(from, to, CurrencyCode::parse("USD").unwrap(), amount, key).unwrap()
    }

    fn seeded(alice_funds: i64, bob_funds: i64) -> (InMemoryStore, AccountId, AccountId) {
        let store = InMemoryStore::new();
        let alice = AccountId::new();
        let bob = AccountId::new();
        store.open_account(alice, alice_funds);
        store.open_account(bob, bob_funds);
        (store, alice, bob)
    }

    #[tokio::test]
    async fn committed_transfer_moves_funds() {
        let (store, alice, bob) = seeded(100, 10);
        let key = IdempotencyKey::new();

        let tx = store.begin().await.unwrap();
        let after = tx.apply_transfer(&transfer(alice, bob, 40, key)).await.unwrap();
        assert_eq!(after.funds, 60);
        tx.commit().await.unwrap();

        assert_eq!(store.balance_of(&alice), Some(60));
        assert_eq!(store.balance_of(&bob), Some(50));
        assert!(store.has_transfer(&key));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn staged_writes_are_visible_inside_but_not_outside() {
        let (store, alice, bob) = seeded(100, 0);

        let tx = store.begin().await.unwrap();
        tx.apply_transfer(&transfer(alice, bob, 30, IdempotencyKey::new()))
            .await
            .unwrap();

        assert_eq!(tx.balance(&alice).await.unwrap().funds, 70);
        assert_eq!(store.balance_of(&alice), Some(100));

        tx.rollback().await.unwrap();
        assert_eq!(store.balance_of(&alice), Some(100));
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let store = InMemoryStore::new();
        let ghost = AccountId::new();

        let tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(&ghost).await, Err(StoreError::NotFound(ghost)));
    }

    #[tokio::test]
    async fn replayed_key_is_rejected() {
        let (store, alice, bob) = seeded(100, 0);
        let key = IdempotencyKey::new();

        let tx = store.begin().await.unwrap();
        tx.apply_transfer(&transfer(alice, bob, 10, key)).await.unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin().await.unwrap();
        let err = tx.apply_transfer(&transfer(alice, bob, 10, key)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.balance_of(&alice), Some(90));
    }

    #[tokio::test]
    async fn racing_transactions_with_same_key_commit_once() {
        let (store, alice, bob) = seeded(100, 0);
        let key = IdempotencyKey::new();

        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();
        first.apply_transfer(&transfer(alice, bob, 10, key)).await.unwrap();
        second.apply_transfer(&transfer(alice, bob, 10, key)).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Duplicate(_))));
        assert_eq!(store.balance_of(&alice), Some(90));
    }

    #[tokio::test]
    async fn overdraft_is_a_constraint_violation() {
        let (store, alice, bob) = seeded(5, 0);

        let tx = store.begin().await.unwrap();
        let err = tx
            .apply_transfer(&transfer(alice, bob, 6, IdempotencyKey::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn credit_past_max_funds_is_rejected_before_staging() {
        let (store, alice, bob) = seeded(10, i64::MAX);

        let tx = store.begin().await.unwrap();
        let err = tx
            .apply_transfer(&transfer(alice, bob, 1, IdempotencyKey::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(tx.balance(&alice).await.unwrap().funds, 10);
        tx.rollback().await.unwrap();

        assert_eq!(store.balance_of(&bob), Some(i64::MAX));
    }

    #[tokio::test]
    async fn overflow_at_commit_leaves_the_store_usable() {
        let (store, alice, bob) = seeded(10, i64::MAX - 5);

        // Staged while the receiver still had room.
        let late = store.begin().await.unwrap();
        late.apply_transfer(&transfer(alice, bob, 3, IdempotencyKey::new()))
            .await
            .unwrap();

        let early = store.begin().await.unwrap();
        early
            .apply_transfer(&transfer(alice, bob, 5, IdempotencyKey::new()))
            .await
            .unwrap();
        early.commit().await.unwrap();

        assert!(matches!(late.commit().await, Err(StoreError::Constraint(_))));
        assert_eq!(store.balance_of(&alice), Some(5));
        assert_eq!(store.balance_of(&bob), Some(i64::MAX));

        let tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(&alice).await.unwrap().funds, 5);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn finished_handle_rejects_further_use() {
        let (store, alice, _) = seeded(5, 0);

        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tx.balance(&alice).await, Err(StoreError::Finished));
        assert_eq!(tx.rollback().await, Err(StoreError::Finished));
    }
}
