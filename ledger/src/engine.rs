//! Core ledger engine implementation.
//!
//! Money movement is two-phase. Deposits, withdrawals and transfers only
//! record pending entries; balances change exclusively when entries are
//! captured. Every operation runs inside one unit of work and either commits
//! all of its writes or none of them.

use std::collections::HashSet;
use std::sync::Arc;

use corebank_common::{
    AccountId, AccountOrder, Amount, LedgerError, LedgerResult, Page, Pagination,
    TransactionFilter, TransactionId, TransactionOrder, UserId, DEFAULT_LIMIT,
};
use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use crate::account::Account;
use crate::balance::AccountBalance;
use crate::config::LedgerConfig;
use crate::retry::RetryPolicy;
use crate::store::{AccountStore, LedgerStore, TransactionStore, UnitOfWork, UnitOfWorkManager};
use crate::transaction::{NewTransaction, Transaction, TransactionType, TransferPair};

/// The ledger engine records and settles money movement between accounts.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    default_page_limit: u32,
    max_page_limit: u32,
}

impl LedgerEngine {
    /// Create an engine that runs every operation once.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::single_attempt(),
            default_page_limit: DEFAULT_LIMIT,
            max_page_limit: 100,
        }
    }

    /// Create an engine with retry and paging taken from `config`.
    pub fn from_config(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        Self::new(store)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_page_limits(config.default_page_limit, config.max_page_limit)
    }

    /// Retry money-movement operations that fail on a serialization conflict.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Page size used for a zero limit, and the largest page served.
    pub fn with_page_limits(mut self, default_limit: u32, max_limit: u32) -> Self {
        self.default_page_limit = default_limit;
        self.max_page_limit = max_limit;
        self
    }

    /// Record a pending credit on `account_id`.
    #[instrument(skip(self))]
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> LedgerResult<Transaction> {
        let record = self
            .retry
            .run("deposit", || async move {
                let mut uow = self.store.begin().await?;
                let result = record_deposit(uow.as_mut(), account_id, amount).await;
                finish(uow, result).await
            })
            .await?;

        info!(
            account_id = %account_id,
            amount = %amount,
            transaction_id = %record.id,
            "Deposit recorded"
        );
        Ok(record)
    }

    /// Record a pending debit on `account_id` if its settled balance covers it.
    #[instrument(skip(self))]
    pub async fn withdrawal(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> LedgerResult<Transaction> {
        let record = self
            .retry
            .run("withdrawal", || async move {
                let mut uow = self.store.begin().await?;
                let result = record_withdrawal(uow.as_mut(), account_id, amount).await;
                finish(uow, result).await
            })
            .await?;

        info!(
            account_id = %account_id,
            amount = %amount,
            transaction_id = %record.id,
            "Withdrawal recorded"
        );
        Ok(record)
    }

    /// Record a pending debit on `from` and a matching pending credit on `to`.
    ///
    /// Either both records are persisted or neither is.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferPair> {
        if from == to {
            warn!(account_id = %from, "Transfer to the same account rejected");
            return Err(LedgerError::InvalidRequest(
                "cannot transfer to the same account".to_string(),
            ));
        }

        let pair = self
            .retry
            .run("transfer", || async move {
                let mut uow = self.store.begin().await?;
                let result = record_transfer(uow.as_mut(), from, to, amount).await;
                finish(uow, result).await
            })
            .await?;

        info!(
            from = %from,
            to = %to,
            amount = %amount,
            debit_id = %pair.debit.id,
            credit_id = %pair.credit.id,
            "Transfer recorded"
        );
        Ok(pair)
    }

    /// Settle the pending records named by `ids` that `account_id` is a party to.
    ///
    /// All records are settled together or none is. Duplicate ids count once.
    #[instrument(skip(self))]
    pub async fn capture_transactions(
        &self,
        account_id: AccountId,
        ids: &[TransactionId],
    ) -> LedgerResult<()> {
        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<TransactionId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        if unique.is_empty() {
            warn!(account_id = %account_id, "Capture without transaction ids rejected");
            return Err(LedgerError::InvalidRequest(
                "no transactions to capture".to_string(),
            ));
        }

        let unique = &unique;
        self.retry
            .run("capture", || async move {
                let mut uow = self.store.begin().await?;
                let result = capture(uow.as_mut(), account_id, unique).await;
                finish(uow, result).await
            })
            .await?;

        info!(
            account_id = %account_id,
            count = unique.len(),
            "Transactions captured"
        );
        Ok(())
    }

    /// Open an empty account for `owner_id`.
    #[instrument(skip(self))]
    pub async fn open_account(&self, owner_id: UserId) -> LedgerResult<Account> {
        let account = AccountStore::create(self.store.as_ref(), owner_id, Decimal::ZERO).await?;
        info!(account_id = %account.id, owner_id = %owner_id, "Account opened");
        Ok(account)
    }

    /// Fetch an active account.
    pub async fn account(&self, id: AccountId) -> LedgerResult<Account> {
        AccountStore::get_by_id(self.store.as_ref(), id).await
    }

    /// List an owner's active accounts.
    pub async fn accounts_for_owner(
        &self,
        owner_id: UserId,
        page: Pagination<AccountOrder>,
    ) -> LedgerResult<Page<Account>> {
        let page = page.clamped(self.default_page_limit, self.max_page_limit);
        self.store.get_all_by_owner(owner_id, &page).await
    }

    /// List the records booked against an account.
    pub async fn account_transactions(
        &self,
        account_id: AccountId,
        filter: &TransactionFilter,
        page: Pagination<TransactionOrder>,
    ) -> LedgerResult<Page<Transaction>> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LedgerError::InvalidRequest(
                    "time range starts after it ends".to_string(),
                ));
            }
        }

        AccountStore::get_by_id(self.store.as_ref(), account_id).await?;
        let page = page.clamped(self.default_page_limit, self.max_page_limit);
        self.store.get_by_account_id(account_id, filter, &page).await
    }

    /// Fetch a record booked against `account_id`.
    pub async fn transaction(
        &self,
        id: TransactionId,
        account_id: AccountId,
    ) -> LedgerResult<Transaction> {
        TransactionStore::get_by_id(self.store.as_ref(), id, account_id).await
    }

    /// Retire an account that holds no money and has nothing pending.
    ///
    /// A record created for the account concurrently makes one of the two
    /// units fail, so no pending record can outlive its account.
    #[instrument(skip(self))]
    pub async fn retire_account(&self, id: AccountId) -> LedgerResult<()> {
        self.retry
            .run("retire", || async move {
                let mut uow = self.store.begin().await?;
                let result = retire(uow.as_mut(), id).await;
                finish(uow, result).await
            })
            .await?;

        info!(account_id = %id, "Account retired");
        Ok(())
    }

    /// Compare an account's stored balance against its settled records.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, account_id: AccountId) -> LedgerResult<AccountBalance> {
        let account = AccountStore::get_by_id(self.store.as_ref(), account_id).await?;
        let totals = self.store.settlement_totals(account_id).await?;
        let balance = AccountBalance::new(account_id, account.balance, totals);

        if !balance.is_consistent() {
            warn!(
                account_id = %account_id,
                balance = %balance.balance,
                settled_net = %totals.settled_net(),
                "Balance does not match settled records"
            );
        }
        Ok(balance)
    }
}

/// Commit on success, abort on failure.
async fn finish<T>(uow: Box<dyn UnitOfWork>, result: LedgerResult<T>) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            uow.commit().await.map_err(|err| {
                log_failure("commit", &err);
                err
            })?;
            Ok(value)
        }
        Err(err) => {
            log_failure("operation", &err);
            if let Err(abort_err) = uow.abort().await {
                error!(error = %abort_err, "Failed to abort unit of work");
            }
            Err(err)
        }
    }
}

fn log_failure(stage: &str, err: &LedgerError) {
    if err.is_client_error() || err.is_retryable() {
        warn!(stage, code = err.error_code(), error = %err, "Ledger operation rejected");
    } else {
        error!(stage, code = err.error_code(), error = %err, "Ledger operation failed");
    }
}

/// Persist a record, reporting plain storage failures as a failed create.
async fn persist(uow: &mut dyn UnitOfWork, txn: NewTransaction) -> LedgerResult<Transaction> {
    let entry = txn.transaction_type;
    uow.create_transaction(txn).await.map_err(|err| match err {
        LedgerError::Storage(reason) => LedgerError::TransactionCreateFailed {
            entry: entry.to_string(),
            reason,
        },
        other => other,
    })
}

async fn record_deposit(
    uow: &mut dyn UnitOfWork,
    account_id: AccountId,
    amount: Amount,
) -> LedgerResult<Transaction> {
    let account = uow.account_by_id(account_id).await?;
    persist(uow, NewTransaction::credit(account.id, account.id, amount)).await
}

async fn record_withdrawal(
    uow: &mut dyn UnitOfWork,
    account_id: AccountId,
    amount: Amount,
) -> LedgerResult<Transaction> {
    let account = uow.account_by_id(account_id).await?;
    account.ensure_funds(amount)?;
    persist(uow, NewTransaction::debit(account.id, account.id, amount)).await
}

async fn record_transfer(
    uow: &mut dyn UnitOfWork,
    from: AccountId,
    to: AccountId,
    amount: Amount,
) -> LedgerResult<TransferPair> {
    let source = uow.account_by_id(from).await?;
    let destination = uow.account_by_id(to).await?;
    source.ensure_funds(amount)?;

    let debit = persist(uow, NewTransaction::debit(source.id, destination.id, amount)).await?;
    let credit = persist(uow, NewTransaction::credit(destination.id, source.id, amount)).await?;
    Ok(TransferPair { debit, credit })
}

async fn capture(
    uow: &mut dyn UnitOfWork,
    account_id: AccountId,
    ids: &[TransactionId],
) -> LedgerResult<()> {
    let mut records = uow.transactions_by_ids(ids, account_id).await?;

    if records.len() != ids.len() {
        return Err(LedgerError::TransactionCountMismatch {
            requested: ids.len(),
            found: records.len(),
        });
    }

    if let Some(settled) = records.iter().find(|t| !t.is_pending()) {
        return Err(LedgerError::TransactionNotFound(settled.id));
    }

    // Credits first so a batch never fails on an ordering artefact.
    records.sort_by_key(|t| t.transaction_type == TransactionType::Debit);

    for txn in &records {
        let mut owner = uow.account_by_id(txn.account_id).await?;
        owner.apply(txn)?;
        uow.update_balance(&owner).await?;
    }

    uow.approve_batch(ids, account_id).await
}

async fn retire(uow: &mut dyn UnitOfWork, id: AccountId) -> LedgerResult<()> {
    let account = uow.account_by_id(id).await?;
    if !account.balance.is_zero() {
        return Err(LedgerError::InvalidRequest(format!(
            "account {} still holds {}",
            id, account.balance
        )));
    }

    let totals = uow.settlement_totals(id).await?;
    if !totals.pending_credits.is_zero() || !totals.pending_debits.is_zero() {
        return Err(LedgerError::InvalidRequest(format!(
            "account {} has pending transactions",
            id
        )));
    }

    uow.retire(&account).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedgerStore;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn amount(units: u64) -> Amount {
        Amount::from_units(units).unwrap()
    }

    fn setup() -> (Arc<MemoryLedgerStore>, LedgerEngine) {
        let store = Arc::new(MemoryLedgerStore::new());
        let engine = LedgerEngine::new(store.clone());
        (store, engine)
    }

    async fn funded(store: &MemoryLedgerStore, balance: Decimal) -> AccountId {
        AccountStore::create(store, UserId::new(), balance)
            .await
            .unwrap()
            .id
    }

    async fn balance_of(engine: &LedgerEngine, id: AccountId) -> Decimal {
        engine.account(id).await.unwrap().balance
    }

    #[tokio::test]
    async fn test_transfer_then_capture_end_to_end() {
        let (store, engine) = setup();
        let a = funded(&store, dec!(200)).await;
        let b = funded(&store, dec!(200)).await;

        let pair = engine.transfer(a, b, amount(100)).await.unwrap();
        assert!(pair.is_balanced());
        assert!(pair.debit.is_pending() && pair.credit.is_pending());
        assert_eq!(pair.debit.account_id, a);
        assert_eq!(pair.debit.recipient_id, b);
        assert_eq!(pair.credit.account_id, b);
        assert_eq!(pair.credit.recipient_id, a);

        // Nothing moves before capture.
        assert_eq!(balance_of(&engine, a).await, dec!(200));
        assert_eq!(balance_of(&engine, b).await, dec!(200));

        engine.capture_transactions(a, &pair.ids()).await.unwrap();

        assert_eq!(balance_of(&engine, a).await, dec!(100));
        assert_eq!(balance_of(&engine, b).await, dec!(300));

        let debit = engine.transaction(pair.debit.id, a).await.unwrap();
        let credit = engine.transaction(pair.credit.id, b).await.unwrap();
        for txn in [debit, credit] {
            assert!(txn.approved && txn.done);
            assert!(txn.done_timestamp.is_some());
        }
    }

    #[tokio::test]
    async fn test_transfer_is_atomic_when_credit_fails() {
        let (store, engine) = setup();
        let a = funded(&store, dec!(200)).await;
        let b = funded(&store, dec!(200)).await;

        store.fail_transaction_create_after(1);
        let err = engine.transfer(a, b, amount(100)).await.unwrap_err();

        match err {
            LedgerError::TransactionCreateFailed { entry, .. } => assert_eq!(entry, "credit"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(balance_of(&engine, a).await, dec!(200));
        assert_eq!(balance_of(&engine, b).await, dec!(200));
    }

    #[tokio::test]
    async fn test_second_capture_is_rejected() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        let deposit = engine.deposit(a, amount(75)).await.unwrap();
        engine.capture_transactions(a, &[deposit.id]).await.unwrap();
        assert_eq!(balance_of(&engine, a).await, dec!(75));

        let err = engine
            .capture_transactions(a, &[deposit.id])
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::TransactionNotFound(deposit.id));
        assert_eq!(balance_of(&engine, a).await, dec!(75));
    }

    #[tokio::test]
    async fn test_capture_with_unknown_id_aborts_entirely() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;
        let other = funded(&store, Decimal::ZERO).await;

        let mine = engine.deposit(a, amount(10)).await.unwrap();
        let foreign = engine.deposit(other, amount(10)).await.unwrap();

        for stray in [foreign.id, TransactionId::new()] {
            let err = engine
                .capture_transactions(a, &[mine.id, stray])
                .await
                .unwrap_err();
            assert_eq!(
                err,
                LedgerError::TransactionCountMismatch {
                    requested: 2,
                    found: 1
                }
            );
        }

        assert_eq!(balance_of(&engine, a).await, Decimal::ZERO);
        assert!(engine.transaction(mine.id, a).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_insufficient_funds_records_nothing() {
        let (store, engine) = setup();
        let a = funded(&store, dec!(50)).await;
        let b = funded(&store, Decimal::ZERO).await;

        let err = engine.transfer(a, b, amount(100)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let err = engine.withdrawal(a, amount(51)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_cannot_overdraw() {
        let (store, engine) = setup();
        let a = funded(&store, dec!(100)).await;

        // Both withdrawals pass the check against the settled balance.
        let first = engine.withdrawal(a, amount(80)).await.unwrap();
        let second = engine.withdrawal(a, amount(80)).await.unwrap();

        engine.capture_transactions(a, &[first.id]).await.unwrap();
        let err = engine
            .capture_transactions(a, &[second.id])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance_of(&engine, a).await, dec!(20));
    }

    #[tokio::test]
    async fn test_capture_rejects_balance_past_money_column() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        assert!(matches!(
            Amount::new(Decimal::MAX),
            Err(LedgerError::InvalidAmount(_))
        ));

        let largest = Amount::new(dec!(9999999999999999.9999)).unwrap();
        let first = engine.deposit(a, largest).await.unwrap();
        let second = engine.deposit(a, largest).await.unwrap();

        let err = engine
            .capture_transactions(a, &[first.id, second.id])
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::BalanceOverflow(a));
        assert_eq!(balance_of(&engine, a).await, Decimal::ZERO);
        assert_eq!(store.pending_transactions().len(), 2);

        engine.capture_transactions(a, &[first.id]).await.unwrap();
        assert_eq!(balance_of(&engine, a).await, largest.value());
    }

    #[tokio::test]
    async fn test_request_shape_rejections() {
        let (store, engine) = setup();
        let a = funded(&store, dec!(10)).await;

        assert!(matches!(
            engine.transfer(a, a, amount(1)).await,
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.capture_transactions(a, &[]).await,
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.deposit(AccountId::new(), amount(1)).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_capture_ids_count_once() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        let deposit = engine.deposit(a, amount(5)).await.unwrap();
        engine
            .capture_transactions(a, &[deposit.id, deposit.id])
            .await
            .unwrap();
        assert_eq!(balance_of(&engine, a).await, dec!(5));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_when_enabled() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        store.force_commit_conflicts(1);
        let err = engine.deposit(a, amount(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.transaction_count(), 0);

        let engine = engine.with_retry_policy(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ));
        store.force_commit_conflicts(2);
        engine.deposit(a, amount(1)).await.unwrap();
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        store.set_unavailable(true);
        let err = engine.deposit(a, amount(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));
        assert_eq!(err.client_message(), "Internal error");
    }

    #[tokio::test]
    async fn test_concurrent_capture_settles_once() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;
        let deposit = engine.deposit(a, amount(40)).await.unwrap();

        // Interleave two captures by hand: both read before either commits.
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        capture(first.as_mut(), a, &[deposit.id]).await.unwrap();
        capture(second.as_mut(), a, &[deposit.id]).await.unwrap();
        first.commit().await.unwrap();
        assert!(second.commit().await.unwrap_err().is_retryable());

        assert_eq!(balance_of(&engine, a).await, dec!(40));
    }

    #[tokio::test]
    async fn test_listings_and_reconcile() {
        let (store, engine) = setup();
        let owner = UserId::new();
        let a = engine.open_account(owner).await.unwrap().id;
        engine.open_account(owner).await.unwrap();

        let accounts = engine
            .accounts_for_owner(owner, Pagination::new(0, 0))
            .await
            .unwrap();
        assert_eq!(accounts.total, 2);

        let settled = engine.deposit(a, amount(30)).await.unwrap();
        engine.capture_transactions(a, &[settled.id]).await.unwrap();
        engine.withdrawal(a, amount(10)).await.unwrap();

        let history = engine
            .account_transactions(a, &TransactionFilter::default(), Pagination::new(1000, 0))
            .await
            .unwrap();
        assert_eq!(history.total, 2);

        let balance = engine.reconcile(a).await.unwrap();
        assert!(balance.is_consistent());
        assert_eq!(balance.balance, dec!(30));
        assert_eq!(balance.pending_debits, dec!(10));
        assert_eq!(balance.projected(), dec!(20));

        assert!(engine.retire_account(a).await.is_err());
        assert_eq!(store.pending_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_retire_empty_account() {
        let (_store, engine) = setup();
        let account = engine.open_account(UserId::new()).await.unwrap();

        engine.retire_account(account.id).await.unwrap();
        assert_eq!(
            engine.deposit(account.id, amount(1)).await.unwrap_err(),
            LedgerError::AccountNotFound(account.id)
        );
    }

    #[tokio::test]
    async fn test_retirement_conflicts_with_uncommitted_deposit() {
        let (store, engine) = setup();
        let a = funded(&store, Decimal::ZERO).await;

        // The deposit commits first: retirement must not miss its record.
        let mut deposit = store.begin().await.unwrap();
        record_deposit(deposit.as_mut(), a, amount(5)).await.unwrap();
        let mut retirement = store.begin().await.unwrap();
        retire(retirement.as_mut(), a).await.unwrap();
        deposit.commit().await.unwrap();
        assert!(retirement.commit().await.unwrap_err().is_retryable());

        assert!(matches!(
            engine.retire_account(a).await,
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(engine.account(a).await.is_ok());

        // Retirement commits first: the deposit must not land on it.
        let b = funded(&store, Decimal::ZERO).await;
        let mut deposit = store.begin().await.unwrap();
        record_deposit(deposit.as_mut(), b, amount(5)).await.unwrap();
        let mut retirement = store.begin().await.unwrap();
        retire(retirement.as_mut(), b).await.unwrap();
        retirement.commit().await.unwrap();
        assert!(deposit.commit().await.unwrap_err().is_retryable());

        assert!(store.pending_transactions().iter().all(|t| t.account_id != b));
        assert_eq!(
            engine.account(b).await.unwrap_err(),
            LedgerError::AccountNotFound(b)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(usize, u64),
        Withdraw(usize, u64),
        Transfer(usize, usize, u64),
        /// Capture the party's pending records selected by the bit mask.
        Capture(usize, u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1..500u64).prop_map(|(a, n)| Op::Deposit(a, n)),
            (0..3usize, 1..500u64).prop_map(|(a, n)| Op::Withdraw(a, n)),
            (0..3usize, 0..3usize, 1..500u64).prop_map(|(a, b, n)| Op::Transfer(a, b, n)),
            (0..3usize, any::<u8>()).prop_map(|(a, mask)| Op::Capture(a, mask)),
        ]
    }

    proptest! {
        #[test]
        fn prop_total_balance_tracks_settled_records(
            ops in proptest::collection::vec(op_strategy(), 1..40)
        ) {
            tokio_test::block_on(async {
                let (store, engine) = setup();
                let owner = UserId::new();
                let mut accounts = Vec::new();
                for _ in 0..3 {
                    accounts.push(engine.open_account(owner).await.unwrap().id);
                }

                let mut external = Decimal::ZERO;
                let mut transfer_halves = Decimal::ZERO;
                for op in ops {
                    match op {
                        Op::Deposit(a, n) => {
                            let _ = engine.deposit(accounts[a], amount(n)).await;
                        }
                        Op::Withdraw(a, n) => {
                            let _ = engine.withdrawal(accounts[a], amount(n)).await;
                        }
                        Op::Transfer(a, b, n) => {
                            let _ = engine.transfer(accounts[a], accounts[b], amount(n)).await;
                        }
                        Op::Capture(a, mask) => {
                            // Subsets may settle one half of a transfer.
                            let batch: Vec<Transaction> = store
                                .pending_transactions()
                                .into_iter()
                                .filter(|t| t.involves(accounts[a]))
                                .enumerate()
                                .filter(|(i, _)| mask & (1u8 << (i % 8)) != 0)
                                .map(|(_, t)| t)
                                .collect();
                            if batch.is_empty() {
                                continue;
                            }
                            let ids: Vec<TransactionId> = batch.iter().map(|t| t.id).collect();
                            if engine.capture_transactions(accounts[a], &ids).await.is_ok() {
                                for txn in &batch {
                                    if txn.account_id == txn.recipient_id {
                                        external += txn.signed_amount();
                                    } else {
                                        transfer_halves += txn.signed_amount();
                                    }
                                }
                            }
                        }
                    }
                }

                assert_eq!(store.total_balance(), external + transfer_halves);
                let transfers_pending = store
                    .pending_transactions()
                    .iter()
                    .any(|t| t.account_id != t.recipient_id);
                if !transfers_pending {
                    // Both halves of every transfer settled, so they cancel out.
                    assert_eq!(transfer_halves, Decimal::ZERO);
                }
                for id in accounts {
                    let balance = engine.reconcile(id).await.unwrap();
                    assert!(balance.is_consistent());
                    assert!(balance.balance >= Decimal::ZERO);
                }
            });
        }
    }
}
