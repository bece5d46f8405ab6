//! CoreBank Ledger Engine
//!
//! Double-entry ledger with two-phase money movement: operations record
//! pending debit/credit entries, and capture settles them into balances inside
//! one serializable unit of work.

pub mod account;
pub mod balance;
pub mod config;
pub mod engine;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod transaction;

pub use account::Account;
pub use balance::{AccountBalance, LedgerTotals};
pub use config::{LedgerConfig, RetryConfig, StorageConfig};
pub use engine::LedgerEngine;
pub use memory::{FaultPlan, MemoryLedgerStore};
pub use postgres::PgLedgerStore;
pub use retry::RetryPolicy;
pub use store::{AccountStore, LedgerStore, TransactionStore, UnitOfWork, UnitOfWorkManager};
pub use transaction::{NewTransaction, Transaction, TransactionType, TransferPair};
