//! Error types for ledger operations.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AccountId, TransactionId};

/// Main error type for ledger operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Account absent, retired, or outside the caller's scope.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Transaction absent, foreign to the account scope, or already settled.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Insufficient funds.
    #[error("Insufficient funds on {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        required: Decimal,
        available: Decimal,
    },

    /// Settling would push a balance past what a money column can hold.
    #[error("Balance overflow on {0}")]
    BalanceOverflow(AccountId),

    /// Capture found fewer usable records than were requested.
    #[error("Transaction count mismatch: requested {requested}, found {found}")]
    TransactionCountMismatch { requested: usize, found: usize },

    /// Persisting a ledger record failed.
    #[error("Failed to create {entry} transaction: {reason}")]
    TransactionCreateFailed { entry: String, reason: String },

    /// Amount is not a valid positive money value.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Request is structurally valid but cannot be executed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage backend cannot be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Storage backend reported a failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Commit-time isolation failure; the whole operation may be retried.
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::SerializationConflict(_))
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LedgerError::SerializationConflict(_) => Some(10),
            LedgerError::StorageUnavailable(_) => Some(1000),
            _ => None,
        }
    }

    /// Whether the error is a rejection the caller can act on, as opposed to
    /// an internal failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_)
                | LedgerError::TransactionNotFound(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::TransactionCountMismatch { .. }
                | LedgerError::BalanceOverflow(_)
                | LedgerError::InvalidAmount(_)
                | LedgerError::InvalidRequest(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::TransactionCountMismatch { .. } => "TRANSACTION_COUNT_MISMATCH",
            LedgerError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            LedgerError::TransactionCreateFailed { .. } => "TRANSACTION_CREATE_FAILED",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::SerializationConflict(_) => "SERIALIZATION_CONFLICT",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Message safe to hand to an API client.
    ///
    /// Storage diagnostics never leave the process; they are replaced by an
    /// opaque message and must be logged by the caller instead.
    pub fn client_message(&self) -> String {
        if self.is_client_error() {
            self.to_string()
        } else if self.is_retryable() {
            "Conflicting concurrent operation, please retry".to_string()
        } else {
            "Internal error".to_string()
        }
    }
}

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
