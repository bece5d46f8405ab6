//! Ledger record types for double-entry bookkeeping.

use std::fmt;
use std::str::FromStr;

use corebank_common::{AccountId, Amount, LedgerError, Timestamp, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Type of ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Money leaving the account.
    Debit,
    /// Money entering the account.
    Credit,
}

impl TransactionType {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "debit",
            TransactionType::Credit => "credit",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(TransactionType::Debit),
            "credit" => Ok(TransactionType::Credit),
            other => Err(LedgerError::Storage(format!(
                "unknown transaction type {:?}",
                other
            ))),
        }
    }
}

/// A persisted ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique record ID.
    pub id: TransactionId,
    /// Account the record is booked against.
    pub account_id: AccountId,
    /// Counterparty; equals `account_id` for deposits and withdrawals.
    pub recipient_id: AccountId,
    /// Positive magnitude.
    pub amount: Decimal,
    /// Debit or credit.
    pub transaction_type: TransactionType,
    /// Set together with `done` when the record is captured.
    pub approved: bool,
    /// Whether the amount has been applied to the balance.
    pub done: bool,
    /// When the record was captured.
    pub done_timestamp: Option<Timestamp>,
    /// When the record was created.
    pub created_at: Timestamp,
    /// Soft-delete marker.
    pub deleted_at: Option<Timestamp>,
}

impl Transaction {
    /// Materialise a pending record from a creation request.
    pub fn from_new(id: TransactionId, new: NewTransaction, created_at: Timestamp) -> Self {
        Self {
            id,
            account_id: new.account_id,
            recipient_id: new.recipient_id,
            amount: new.amount.value(),
            transaction_type: new.transaction_type,
            approved: false,
            done: false,
            done_timestamp: None,
            created_at,
            deleted_at: None,
        }
    }

    /// Whether the record still awaits capture.
    pub fn is_pending(&self) -> bool {
        !self.approved && !self.done && self.deleted_at.is_none()
    }

    /// Whether `account_id` is either side of this record.
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.account_id == account_id || self.recipient_id == account_id
    }

    /// Effect on the owning account's balance once settled.
    pub fn signed_amount(&self) -> Decimal {
        match self.transaction_type {
            TransactionType::Credit => self.amount,
            TransactionType::Debit => -self.amount,
        }
    }

    /// Mark the record settled.
    pub fn settle(&mut self, at: Timestamp) {
        self.approved = true;
        self.done = true;
        self.done_timestamp = Some(at);
    }
}

/// A record to be persisted; the store assigns id and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub recipient_id: AccountId,
    pub amount: Amount,
    pub transaction_type: TransactionType,
}

impl NewTransaction {
    /// Create a debit record.
    pub fn debit(account_id: AccountId, recipient_id: AccountId, amount: Amount) -> Self {
        Self {
            account_id,
            recipient_id,
            amount,
            transaction_type: TransactionType::Debit,
        }
    }

    /// Create a credit record.
    pub fn credit(account_id: AccountId, recipient_id: AccountId, amount: Amount) -> Self {
        Self {
            account_id,
            recipient_id,
            amount,
            transaction_type: TransactionType::Credit,
        }
    }
}

/// The two records produced by a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPair {
    pub debit: Transaction,
    pub credit: Transaction,
}

impl TransferPair {
    /// Verify the pair is balanced and each side names the other as counterparty.
    pub fn is_balanced(&self) -> bool {
        self.debit.transaction_type == TransactionType::Debit
            && self.credit.transaction_type == TransactionType::Credit
            && self.debit.signed_amount() + self.credit.signed_amount() == Decimal::ZERO
            && self.debit.recipient_id == self.credit.account_id
            && self.credit.recipient_id == self.debit.account_id
    }

    /// Ids of both records, debit first.
    pub fn ids(&self) -> [TransactionId; 2] {
        [self.debit.id, self.credit.id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corebank_common::now;

    fn pair(debit_amount: u64, credit_amount: u64) -> TransferPair {
        let a = AccountId::new();
        let b = AccountId::new();
        let created_at = now();
        TransferPair {
            debit: Transaction::from_new(
                TransactionId::new(),
                NewTransaction::debit(a, b, Amount::from_units(debit_amount).unwrap()),
                created_at,
            ),
            credit: Transaction::from_new(
                TransactionId::new(),
                NewTransaction::credit(b, a, Amount::from_units(credit_amount).unwrap()),
                created_at,
            ),
        }
    }

    #[test]
    fn test_balanced_pair() {
        let pair = pair(1000, 1000);
        assert!(pair.is_balanced());
        assert!(pair.debit.is_pending());
        assert!(pair.credit.involves(pair.debit.account_id));
    }

    #[test]
    fn test_unbalanced_pair() {
        assert!(!pair(1000, 999).is_balanced());
    }

    #[test]
    fn test_type_round_trips_through_storage_text() {
        assert_eq!("debit".parse::<TransactionType>().unwrap(), TransactionType::Debit);
        assert_eq!(TransactionType::Credit.as_str(), "credit");
        assert!("refund".parse::<TransactionType>().is_err());
    }

    #[test]
    fn test_settle_is_terminal() {
        let mut txn = pair(5, 5).debit;
        txn.settle(now());
        assert!(txn.approved && txn.done);
        assert!(txn.done_timestamp.is_some());
        assert!(!txn.is_pending());
    }
}
