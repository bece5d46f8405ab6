//! Pagination and filtering for list queries.

use serde::{Deserialize, Serialize};

use crate::{AccountId, Timestamp};

/// Default page size.
pub const DEFAULT_LIMIT: u32 = 10;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// SQL keyword for this direction.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Columns an account listing may be ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOrder {
    #[default]
    CreatedAt,
    UpdatedAt,
    Balance,
}

impl AccountOrder {
    /// Column name in the `accounts` table.
    pub fn column(&self) -> &'static str {
        match self {
            AccountOrder::CreatedAt => "created_at",
            AccountOrder::UpdatedAt => "updated_at",
            AccountOrder::Balance => "balance",
        }
    }
}

/// Columns a transaction listing may be ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOrder {
    #[default]
    CreatedAt,
    Amount,
    DoneTimestamp,
}

impl TransactionOrder {
    /// Column name in the `transactions` table.
    pub fn column(&self) -> &'static str {
        match self {
            TransactionOrder::CreatedAt => "created_at",
            TransactionOrder::Amount => "transaction_amount",
            TransactionOrder::DoneTimestamp => "done_timestamp",
        }
    }
}

/// Limit/offset pagination with ordering.
///
/// The order column is a closed enum so it can be spliced into SQL safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination<O> {
    pub limit: u32,
    pub offset: u32,
    pub order_by: O,
    pub direction: SortDirection,
}

impl<O: Default> Default for Pagination<O> {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
            order_by: O::default(),
            direction: SortDirection::Asc,
        }
    }
}

impl<O: Default> Pagination<O> {
    /// Create pagination with the given limit and offset.
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }
}

impl<O> Pagination<O> {
    /// Set ordering.
    pub fn order_by(mut self, order_by: O, direction: SortDirection) -> Self {
        self.order_by = order_by;
        self.direction = direction;
        self
    }

    /// Replace a zero limit with `default_limit` and cap at `max_limit`.
    pub fn clamped(mut self, default_limit: u32, max_limit: u32) -> Self {
        if self.limit == 0 {
            self.limit = default_limit;
        }
        self.limit = self.limit.min(max_limit);
        self
    }
}

/// Filter for an account's transaction history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Inclusive lower bound on `created_at`.
    pub from: Option<Timestamp>,
    /// Inclusive upper bound on `created_at`.
    pub to: Option<Timestamp>,
    /// Only records naming this account as counterparty.
    pub counterparty: Option<AccountId>,
}

/// One page of a list query together with the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    /// Create a page.
    pub fn new(items: Vec<T>, total: u64) -> Self {
        Self { items, total }
    }
}
