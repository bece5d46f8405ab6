//! Storage contracts for accounts, ledger records and units of work.
//!
//! Unscoped reads live on [`AccountStore`] and [`TransactionStore`]. Every
//! mutation, and every read that a mutation depends on, goes through a
//! [`UnitOfWork`] obtained from [`UnitOfWorkManager::begin`]. A unit of work is
//! serializable: two units touching the same rows either behave as if they ran
//! one after the other or one of them fails with
//! [`LedgerError::SerializationConflict`](corebank_common::LedgerError).

use async_trait::async_trait;
use corebank_common::{
    AccountId, AccountOrder, LedgerResult, Page, Pagination, TransactionFilter, TransactionId,
    TransactionOrder, UserId,
};
use rust_decimal::Decimal;

use crate::account::Account;
use crate::balance::LedgerTotals;
use crate::transaction::{NewTransaction, Transaction};

/// Account reads and creation outside of a unit of work.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an active account.
    async fn get_by_id(&self, id: AccountId) -> LedgerResult<Account>;

    /// List an owner's active accounts.
    async fn get_all_by_owner(
        &self,
        owner_id: UserId,
        page: &Pagination<AccountOrder>,
    ) -> LedgerResult<Page<Account>>;

    /// Open an account. Callers outside tests pass a zero opening balance.
    async fn create(&self, owner_id: UserId, initial_balance: Decimal) -> LedgerResult<Account>;
}

/// Ledger record reads outside of a unit of work.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fetch a record owned by `account_id`.
    async fn get_by_id(
        &self,
        id: TransactionId,
        account_id: AccountId,
    ) -> LedgerResult<Transaction>;

    /// List the records owned by `account_id`.
    async fn get_by_account_id(
        &self,
        account_id: AccountId,
        filter: &TransactionFilter,
        page: &Pagination<TransactionOrder>,
    ) -> LedgerResult<Page<Transaction>>;

    /// Settled and pending sums for `account_id`.
    async fn settlement_totals(&self, account_id: AccountId) -> LedgerResult<LedgerTotals>;
}

/// An open, serializable unit of work.
///
/// `commit` and `abort` consume the unit. Dropping an open unit aborts it.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Read an active account as part of this unit's read set.
    async fn account_by_id(&mut self, id: AccountId) -> LedgerResult<Account>;

    /// Overwrite the stored balance with `account.balance` (last write wins).
    async fn update_balance(&mut self, account: &Account) -> LedgerResult<()>;

    /// Soft-delete an active account read earlier in this unit.
    async fn retire(&mut self, account: &Account) -> LedgerResult<()>;

    /// Settled and pending sums for `account_id`, read as part of this unit.
    ///
    /// A record created for the account by a concurrent unit conflicts with
    /// this read.
    async fn settlement_totals(&mut self, account_id: AccountId) -> LedgerResult<LedgerTotals>;

    /// Persist a pending record and return it as stored.
    async fn create_transaction(&mut self, txn: NewTransaction) -> LedgerResult<Transaction>;

    /// Fetch the records among `ids` that `account_id` is a party to.
    ///
    /// Unknown or foreign ids are dropped; callers compare counts.
    async fn transactions_by_ids(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<Vec<Transaction>>;

    /// Settle the pending records among `ids` that `account_id` is a party to.
    ///
    /// Fails with `TransactionNotFound` naming the first id that was not
    /// flipped when fewer rows than requested were affected.
    async fn approve_batch(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<()>;

    /// Make every write of this unit visible atomically.
    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    /// Discard every write of this unit.
    async fn abort(self: Box<Self>) -> LedgerResult<()>;
}

/// Opens units of work.
#[async_trait]
pub trait UnitOfWorkManager: Send + Sync {
    /// Begin a serializable unit of work.
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>>;
}

/// A complete storage backend.
pub trait LedgerStore: AccountStore + TransactionStore + UnitOfWorkManager {}

impl<T> LedgerStore for T where T: AccountStore + TransactionStore + UnitOfWorkManager {}
