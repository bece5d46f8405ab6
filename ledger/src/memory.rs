//! In-memory storage backend.
//!
//! Units of work buffer their writes and validate their read set at commit
//! (optimistic concurrency): if any row they read or wrote has changed since,
//! the commit fails with `SerializationConflict` and nothing is applied. Commit
//! validation and application happen under one lock, so committed units are
//! equivalent to a serial order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use corebank_common::{
    now, within, AccountId, AccountOrder, LedgerError, LedgerResult, Page, Pagination,
    SortDirection, TransactionFilter, TransactionId, TransactionOrder, UserId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::account::Account;
use crate::balance::LedgerTotals;
use crate::store::{AccountStore, TransactionStore, UnitOfWork, UnitOfWorkManager};
use crate::transaction::{NewTransaction, Transaction, TransactionType};

#[derive(Debug, Clone)]
struct Versioned<T> {
    value: T,
    version: u64,
}

impl<T> Versioned<T> {
    fn new(value: T) -> Self {
        Self { value, version: 1 }
    }

    fn replace(&mut self, value: T) {
        self.value = value;
        self.version += 1;
    }
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<AccountId, Versioned<Account>>,
    transactions: HashMap<TransactionId, Versioned<Transaction>>,
    /// Bumped whenever a record owned by the account is created or settled.
    ledgers: HashMap<AccountId, u64>,
}

impl State {
    fn active_account(&self, id: AccountId) -> Option<&Versioned<Account>> {
        self.accounts.get(&id).filter(|a| a.value.is_active())
    }

    fn ledger_version(&self, id: AccountId) -> u64 {
        self.ledgers.get(&id).copied().unwrap_or(0)
    }

    fn touch_ledger(&mut self, id: AccountId) {
        *self.ledgers.entry(id).or_insert(0) += 1;
    }

    fn version_of(&self, key: RowKey) -> Option<u64> {
        match key {
            RowKey::Account(id) => self.accounts.get(&id).map(|a| a.version),
            RowKey::Transaction(id) => self.transactions.get(&id).map(|t| t.version),
            RowKey::Ledger(id) => Some(self.ledger_version(id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    Transaction(TransactionId),
    /// The set of records owned by an account.
    Ledger(AccountId),
}

/// Faults the in-memory backend can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Every `begin` fails with `StorageUnavailable`.
    pub unavailable: bool,
    /// Let this many record creations succeed, then fail the next one.
    pub fail_create_after: Option<usize>,
    /// Fail this many upcoming commits with `SerializationConflict`.
    pub commit_conflicts: usize,
}

/// Ledger storage held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle storage availability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Let `successes` record creations through, then fail one.
    pub fn fail_transaction_create_after(&self, successes: usize) {
        self.faults.lock().fail_create_after = Some(successes);
    }

    /// Fail the next `count` commits with a serialization conflict.
    pub fn force_commit_conflicts(&self, count: usize) {
        self.faults.lock().commit_conflicts = count;
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    /// Sum of all active account balances.
    pub fn total_balance(&self) -> Decimal {
        self.state
            .lock()
            .accounts
            .values()
            .filter(|a| a.value.is_active())
            .map(|a| a.value.balance)
            .sum()
    }

    /// Number of persisted ledger records.
    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Every pending record, oldest first.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        let state = self.state.lock();
        let mut pending: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.value.is_pending())
            .map(|t| t.value.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }
}

fn paginate<T, O>(
    mut items: Vec<T>,
    page: &Pagination<O>,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Page<T> {
    items.sort_by(|a, b| match page.direction {
        SortDirection::Asc => cmp(a, b),
        SortDirection::Desc => cmp(b, a),
    });
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect();
    Page::new(items, total)
}

/// Sum live records into settled and pending buckets.
fn tally<'a>(records: impl IntoIterator<Item = &'a Transaction>) -> LedgerTotals {
    let mut totals = LedgerTotals::default();
    for txn in records.into_iter().filter(|t| t.deleted_at.is_none()) {
        let bucket = match (txn.done, txn.transaction_type) {
            (true, TransactionType::Credit) => &mut totals.settled_credits,
            (true, TransactionType::Debit) => &mut totals.settled_debits,
            (false, TransactionType::Credit) => &mut totals.pending_credits,
            (false, TransactionType::Debit) => &mut totals.pending_debits,
        };
        *bucket += txn.amount;
    }
    totals
}

fn compare_accounts(order: AccountOrder, a: &Account, b: &Account) -> Ordering {
    let primary = match order {
        AccountOrder::CreatedAt => a.created_at.cmp(&b.created_at),
        AccountOrder::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        AccountOrder::Balance => a.balance.cmp(&b.balance),
    };
    primary.then(a.id.cmp(&b.id))
}

fn compare_transactions(order: TransactionOrder, a: &Transaction, b: &Transaction) -> Ordering {
    let primary = match order {
        TransactionOrder::CreatedAt => a.created_at.cmp(&b.created_at),
        TransactionOrder::Amount => a.amount.cmp(&b.amount),
        TransactionOrder::DoneTimestamp => a.done_timestamp.cmp(&b.done_timestamp),
    };
    primary.then(a.id.cmp(&b.id))
}

#[async_trait]
impl AccountStore for MemoryLedgerStore {
    async fn get_by_id(&self, id: AccountId) -> LedgerResult<Account> {
        self.state
            .lock()
            .active_account(id)
            .map(|a| a.value.clone())
            .ok_or(LedgerError::AccountNotFound(id))
    }

    async fn get_all_by_owner(
        &self,
        owner_id: UserId,
        page: &Pagination<AccountOrder>,
    ) -> LedgerResult<Page<Account>> {
        let accounts: Vec<Account> = self
            .state
            .lock()
            .accounts
            .values()
            .filter(|a| a.value.owner_id == owner_id && a.value.is_active())
            .map(|a| a.value.clone())
            .collect();

        Ok(paginate(accounts, page, |a, b| {
            compare_accounts(page.order_by, a, b)
        }))
    }

    async fn create(&self, owner_id: UserId, initial_balance: Decimal) -> LedgerResult<Account> {
        let account = Account::new(owner_id, initial_balance);
        self.state
            .lock()
            .accounts
            .insert(account.id, Versioned::new(account.clone()));
        Ok(account)
    }
}

#[async_trait]
impl TransactionStore for MemoryLedgerStore {
    async fn get_by_id(
        &self,
        id: TransactionId,
        account_id: AccountId,
    ) -> LedgerResult<Transaction> {
        self.state
            .lock()
            .transactions
            .get(&id)
            .map(|t| &t.value)
            .filter(|t| t.account_id == account_id && t.deleted_at.is_none())
            .cloned()
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    async fn get_by_account_id(
        &self,
        account_id: AccountId,
        filter: &TransactionFilter,
        page: &Pagination<TransactionOrder>,
    ) -> LedgerResult<Page<Transaction>> {
        let records: Vec<Transaction> = self
            .state
            .lock()
            .transactions
            .values()
            .map(|t| &t.value)
            .filter(|t| t.account_id == account_id && t.deleted_at.is_none())
            .filter(|t| within(t.created_at, filter.from, filter.to))
            .filter(|t| filter.counterparty.map_or(true, |c| t.recipient_id == c))
            .cloned()
            .collect();

        Ok(paginate(records, page, |a, b| {
            compare_transactions(page.order_by, a, b)
        }))
    }

    async fn settlement_totals(&self, account_id: AccountId) -> LedgerResult<LedgerTotals> {
        let state = self.state.lock();
        Ok(tally(
            state
                .transactions
                .values()
                .map(|t| &t.value)
                .filter(|t| t.account_id == account_id),
        ))
    }
}

#[async_trait]
impl UnitOfWorkManager for MemoryLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        if self.faults.lock().unavailable {
            return Err(LedgerError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(Box::new(MemoryUnitOfWork {
            state: self.state.clone(),
            faults: self.faults.clone(),
            observed: HashMap::new(),
            balances: HashMap::new(),
            inserted: Vec::new(),
            settled: HashMap::new(),
        }))
    }
}

/// Unit of work over [`MemoryLedgerStore`].
pub struct MemoryUnitOfWork {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<FaultPlan>>,
    /// First version seen for every row read or written.
    observed: HashMap<RowKey, u64>,
    balances: HashMap<AccountId, Account>,
    inserted: Vec<Transaction>,
    settled: HashMap<TransactionId, Transaction>,
}

impl MemoryUnitOfWork {
    fn observe(&mut self, key: RowKey, version: u64) {
        self.observed.entry(key).or_insert(version);
    }

    /// Current view of a record: own writes first, then committed state.
    fn view_transaction(&mut self, id: TransactionId) -> Option<Transaction> {
        if let Some(txn) = self.inserted.iter().find(|t| t.id == id) {
            return Some(txn.clone());
        }
        if let Some(txn) = self.settled.get(&id) {
            return Some(txn.clone());
        }
        let found = self
            .state
            .lock()
            .transactions
            .get(&id)
            .map(|t| (t.value.clone(), t.version));
        found.map(|(txn, version)| {
            self.observe(RowKey::Transaction(id), version);
            txn
        })
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn account_by_id(&mut self, id: AccountId) -> LedgerResult<Account> {
        if let Some(account) = self.balances.get(&id) {
            if !account.is_active() {
                return Err(LedgerError::AccountNotFound(id));
            }
            return Ok(account.clone());
        }
        let found = self
            .state
            .lock()
            .active_account(id)
            .map(|a| (a.value.clone(), a.version));
        let (account, version) = found.ok_or(LedgerError::AccountNotFound(id))?;
        self.observe(RowKey::Account(id), version);
        Ok(account)
    }

    async fn update_balance(&mut self, account: &Account) -> LedgerResult<()> {
        if !self.balances.contains_key(&account.id) {
            let version = self
                .state
                .lock()
                .active_account(account.id)
                .map(|a| a.version)
                .ok_or(LedgerError::AccountNotFound(account.id))?;
            self.observe(RowKey::Account(account.id), version);
        }
        let mut updated = account.clone();
        updated.updated_at = now();
        self.balances.insert(account.id, updated);
        Ok(())
    }

    async fn retire(&mut self, account: &Account) -> LedgerResult<()> {
        let mut current = self.account_by_id(account.id).await?;
        current.retire();
        self.balances.insert(current.id, current);
        Ok(())
    }

    async fn settlement_totals(&mut self, account_id: AccountId) -> LedgerResult<LedgerTotals> {
        let (committed, version) = {
            let state = self.state.lock();
            let committed: Vec<Transaction> = state
                .transactions
                .values()
                .map(|t| &t.value)
                .filter(|t| t.account_id == account_id)
                .cloned()
                .collect();
            (committed, state.ledger_version(account_id))
        };
        self.observe(RowKey::Ledger(account_id), version);

        let records: Vec<Transaction> = committed
            .into_iter()
            .map(|t| self.settled.get(&t.id).cloned().unwrap_or(t))
            .chain(
                self.inserted
                    .iter()
                    .filter(|t| t.account_id == account_id)
                    .cloned(),
            )
            .collect();
        Ok(tally(&records))
    }

    async fn create_transaction(&mut self, txn: NewTransaction) -> LedgerResult<Transaction> {
        {
            let mut faults = self.faults.lock();
            match faults.fail_create_after {
                Some(0) => {
                    faults.fail_create_after = None;
                    return Err(LedgerError::Storage("injected insert failure".to_string()));
                }
                Some(n) => faults.fail_create_after = Some(n - 1),
                None => {}
            }
        }

        let record = Transaction::from_new(TransactionId::new(), txn, now());
        self.inserted.push(record.clone());
        Ok(record)
    }

    async fn transactions_by_ids(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<Vec<Transaction>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(txn) = self.view_transaction(id) {
                if txn.deleted_at.is_none() && txn.involves(account_id) {
                    found.push(txn);
                }
            }
        }
        Ok(found)
    }

    async fn approve_batch(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<()> {
        let settled_at = now();
        let mut seen = HashSet::new();
        let mut approved = Vec::new();
        let mut first_missing = None;

        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.view_transaction(id) {
                Some(mut txn) if txn.is_pending() && txn.involves(account_id) => {
                    txn.settle(settled_at);
                    approved.push(txn);
                }
                _ => {
                    first_missing.get_or_insert(id);
                }
            }
        }

        if let Some(id) = first_missing {
            return Err(LedgerError::TransactionNotFound(id));
        }

        for txn in approved {
            if let Some(own) = self.inserted.iter_mut().find(|t| t.id == txn.id) {
                *own = txn;
            } else {
                self.settled.insert(txn.id, txn);
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        {
            let mut faults = self.faults.lock();
            if faults.unavailable {
                return Err(LedgerError::StorageUnavailable(
                    "in-memory store marked unavailable".to_string(),
                ));
            }
            if faults.commit_conflicts > 0 {
                faults.commit_conflicts -= 1;
                return Err(LedgerError::SerializationConflict(
                    "injected commit conflict".to_string(),
                ));
            }
        }

        let shared = self.state.clone();
        let mut state = shared.lock();

        for (&key, &version) in &self.observed {
            if state.version_of(key) != Some(version) {
                warn!(row = ?key, "Commit rejected, row changed since it was read");
                return Err(LedgerError::SerializationConflict(format!(
                    "{:?} modified by a concurrent unit of work",
                    key
                )));
            }
        }

        let Self {
            balances,
            inserted,
            settled,
            ..
        } = *self;

        for (id, account) in balances {
            if let Some(row) = state.accounts.get_mut(&id) {
                row.replace(account);
            }
        }
        for txn in inserted {
            state.touch_ledger(txn.account_id);
            state.transactions.insert(txn.id, Versioned::new(txn));
        }
        for (id, txn) in settled {
            state.touch_ledger(txn.account_id);
            if let Some(row) = state.transactions.get_mut(&id) {
                row.replace(txn);
            }
        }

        debug!("In-memory unit of work committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> LedgerResult<()> {
        debug!(
            discarded_records = self.inserted.len(),
            discarded_balances = self.balances.len(),
            "In-memory unit of work aborted"
        );
        Ok(())
    }
}
