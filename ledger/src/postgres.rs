//! PostgreSQL storage backend.

use std::collections::HashSet;

use async_trait::async_trait;
use corebank_common::{
    AccountId, AccountOrder, LedgerError, LedgerResult, Page, Pagination, TransactionFilter,
    TransactionId, TransactionOrder, UserId,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::account::Account;
use crate::balance::LedgerTotals;
use crate::config::StorageConfig;
use crate::store::{AccountStore, TransactionStore, UnitOfWork, UnitOfWorkManager};
use crate::transaction::{NewTransaction, Transaction, TransactionType};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const ACCOUNT_COLUMNS: &str = "guid, user_id, balance, created_at, updated_at, deleted_at";

const TRANSACTION_COLUMNS: &str = "guid, account_id, recipient_id, transaction_amount, \
     transaction_type, approved, done, done_timestamp, created_at, deleted_at";

const SETTLEMENT_TOTALS: &str = r#"
    SELECT
        COALESCE(SUM(transaction_amount) FILTER (WHERE done AND transaction_type = 'credit'), 0)
            AS settled_credits,
        COALESCE(SUM(transaction_amount) FILTER (WHERE done AND transaction_type = 'debit'), 0)
            AS settled_debits,
        COALESCE(SUM(transaction_amount) FILTER (WHERE NOT done AND transaction_type = 'credit'), 0)
            AS pending_credits,
        COALESCE(SUM(transaction_amount) FILTER (WHERE NOT done AND transaction_type = 'debit'), 0)
            AS pending_debits
    FROM transactions
    WHERE account_id = $1 AND deleted_at IS NULL
"#;

/// Map an SQLSTATE code to a ledger error.
pub(crate) fn classify_sqlstate(code: &str, message: String) -> LedgerError {
    match code {
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => LedgerError::SerializationConflict(message),
        // connection_exception class, admin shutdown
        c if c.starts_with("08") || c == "57P01" => LedgerError::StorageUnavailable(message),
        _ => LedgerError::Storage(message),
    }
}

fn map_sqlx(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::StorageUnavailable(err.to_string())
        }
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(&code, db.message().to_string()),
            None => LedgerError::Storage(err.to_string()),
        },
        _ => LedgerError::Storage(err.to_string()),
    }
}

/// Split a migration file into executable statements.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| {
        s.lines()
            .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"))
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("guid")?),
        owner_id: UserId::from_uuid(row.try_get("user_id")?),
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn totals_from_row(row: &PgRow) -> Result<LedgerTotals, sqlx::Error> {
    Ok(LedgerTotals {
        settled_credits: row.try_get("settled_credits")?,
        settled_debits: row.try_get("settled_debits")?,
        pending_credits: row.try_get("pending_credits")?,
        pending_debits: row.try_get("pending_debits")?,
    })
}

fn transaction_from_row(row: &PgRow) -> LedgerResult<Transaction> {
    let stored_type: String = row.try_get("transaction_type").map_err(map_sqlx)?;
    let transaction_type: TransactionType = stored_type.parse()?;
    decode_transaction(row, transaction_type).map_err(map_sqlx)
}

fn decode_transaction(
    row: &PgRow,
    transaction_type: TransactionType,
) -> Result<Transaction, sqlx::Error> {
    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("guid")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        recipient_id: AccountId::from_uuid(row.try_get("recipient_id")?),
        amount: row.try_get("transaction_amount")?,
        transaction_type,
        approved: row.try_get("approved")?,
        done: row.try_get("done")?,
        done_timestamp: row.try_get("done_timestamp")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn uuids(ids: &[TransactionId]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(**id))
        .map(|id| *id.as_uuid())
        .collect()
}

/// Ledger storage in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool as configured.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &StorageConfig) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|err| {
                error!(error = %err, "Failed to connect to ledger database");
                map_sqlx(err)
            })?;

        info!("Connected to ledger database");
        Ok(Self::new(pool))
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> LedgerResult<()> {
        for statement in statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        info!("Ledger schema applied");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgLedgerStore {
    async fn get_by_id(&self, id: AccountId) -> LedgerResult<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE guid = $1 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => account_from_row(&row).map_err(map_sqlx),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn get_all_by_owner(
        &self,
        owner_id: UserId,
        page: &Pagination<AccountOrder>,
    ) -> LedgerResult<Page<Account>> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM accounts WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(owner_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE user_id = $1 AND deleted_at IS NULL \
             ORDER BY {} {}, guid LIMIT $2 OFFSET $3",
            page.order_by.column(),
            page.direction.as_sql()
        ))
        .bind(owner_id.as_uuid())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let accounts = rows
            .iter()
            .map(account_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx)?;
        Ok(Page::new(accounts, total as u64))
    }

    async fn create(&self, owner_id: UserId, initial_balance: Decimal) -> LedgerResult<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (user_id, balance) VALUES ($1, $2) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(owner_id.as_uuid())
        .bind(initial_balance)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        account_from_row(&row).map_err(map_sqlx)
    }
}

#[async_trait]
impl TransactionStore for PgLedgerStore {
    async fn get_by_id(
        &self,
        id: TransactionId,
        account_id: AccountId,
    ) -> LedgerResult<Transaction> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE guid = $1 AND account_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .bind(account_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => transaction_from_row(&row),
            None => Err(LedgerError::TransactionNotFound(id)),
        }
    }

    async fn get_by_account_id(
        &self,
        account_id: AccountId,
        filter: &TransactionFilter,
        page: &Pagination<TransactionOrder>,
    ) -> LedgerResult<Page<Transaction>> {
        const FILTER: &str = "account_id = $1 AND deleted_at IS NULL \
             AND ($2::timestamptz IS NULL OR created_at >= $2) \
             AND ($3::timestamptz IS NULL OR created_at <= $3) \
             AND ($4::uuid IS NULL OR recipient_id = $4)";

        let counterparty = filter.counterparty.map(|c| *c.as_uuid());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM transactions WHERE {FILTER}"
        ))
        .bind(account_id.as_uuid())
        .bind(filter.from)
        .bind(filter.to)
        .bind(counterparty)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE {FILTER} \
             ORDER BY {} {}, guid LIMIT $5 OFFSET $6",
            page.order_by.column(),
            page.direction.as_sql()
        ))
        .bind(account_id.as_uuid())
        .bind(filter.from)
        .bind(filter.to)
        .bind(counterparty)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let records = rows
            .iter()
            .map(transaction_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(Page::new(records, total as u64))
    }

    async fn settlement_totals(&self, account_id: AccountId) -> LedgerResult<LedgerTotals> {
        let row = sqlx::query(SETTLEMENT_TOTALS)
            .bind(account_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        totals_from_row(&row).map_err(map_sqlx)
    }
}

#[async_trait]
impl UnitOfWorkManager for PgLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

/// Unit of work over a serializable PostgreSQL transaction.
///
/// Dropping it without commit rolls the transaction back.
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn account_by_id(&mut self, id: AccountId) -> LedgerResult<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE guid = $1 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => account_from_row(&row).map_err(map_sqlx),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn update_balance(&mut self, account: &Account) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = $2, updated_at = NOW() \
             WHERE guid = $1 AND deleted_at IS NULL",
        )
        .bind(account.id.as_uuid())
        .bind(account.balance)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account.id));
        }
        Ok(())
    }

    async fn create_transaction(&mut self, txn: NewTransaction) -> LedgerResult<Transaction> {
        let row = sqlx::query(&format!(
            "INSERT INTO transactions \
             (account_id, recipient_id, transaction_amount, transaction_type) \
             VALUES ($1, $2, $3, $4) RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(txn.account_id.as_uuid())
        .bind(txn.recipient_id.as_uuid())
        .bind(txn.amount.value())
        .bind(txn.transaction_type.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        transaction_from_row(&row)
    }

    async fn transactions_by_ids(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE guid = ANY($1) AND (account_id = $2 OR recipient_id = $2) \
             AND deleted_at IS NULL"
        ))
        .bind(uuids(ids))
        .bind(account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn settlement_totals(&mut self, account_id: AccountId) -> LedgerResult<LedgerTotals> {
        let row = sqlx::query(SETTLEMENT_TOTALS)
            .bind(account_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        totals_from_row(&row).map_err(map_sqlx)
    }

    async fn retire(&mut self, account: &Account) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET deleted_at = NOW(), updated_at = NOW() \
             WHERE guid = $1 AND deleted_at IS NULL",
        )
        .bind(account.id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account.id));
        }
        Ok(())
    }

    async fn approve_batch(
        &mut self,
        ids: &[TransactionId],
        account_id: AccountId,
    ) -> LedgerResult<()> {
        let requested = uuids(ids);
        let flipped: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE transactions \
             SET approved = TRUE, done = TRUE, done_timestamp = NOW() \
             WHERE guid = ANY($1) AND (account_id = $2 OR recipient_id = $2) \
             AND deleted_at IS NULL AND approved = FALSE AND done = FALSE \
             RETURNING guid",
        )
        .bind(requested.as_slice())
        .bind(account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let flipped: HashSet<Uuid> = flipped.into_iter().collect();
        match requested.iter().find(|id| !flipped.contains(id)) {
            Some(missing) => Err(LedgerError::TransactionNotFound(TransactionId::from_uuid(
                *missing,
            ))),
            None => Ok(()),
        }
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx.commit().await.map_err(map_sqlx)?;
        debug!("Unit of work committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> LedgerResult<()> {
        self.tx.rollback().await.map_err(map_sqlx)?;
        debug!("Unit of work rolled back");
        Ok(())
    }
}
