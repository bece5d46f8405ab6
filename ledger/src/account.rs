//! Account definitions for ledger.

use corebank_common::{
    fits_money_column, now, AccountId, Amount, LedgerError, LedgerResult, Timestamp, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::transaction::{Transaction, TransactionType};

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Owning user.
    pub owner_id: UserId,
    /// Settled balance.
    pub balance: Decimal,
    /// When the account was created.
    pub created_at: Timestamp,
    /// When the account was last updated.
    pub updated_at: Timestamp,
    /// Set when the account is retired.
    pub deleted_at: Option<Timestamp>,
}

impl Account {
    /// Create a new account.
    pub fn new(owner_id: UserId, balance: Decimal) -> Self {
        let created_at = now();

        Self {
            id: AccountId::new(),
            owner_id,
            balance,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    /// Check if account can transact.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Check if the settled balance covers `amount`.
    pub fn has_sufficient_funds(&self, amount: Amount) -> bool {
        self.balance >= amount.value()
    }

    /// Fail with `InsufficientFunds` unless the balance covers `amount`.
    pub fn ensure_funds(&self, amount: Amount) -> LedgerResult<()> {
        if self.has_sufficient_funds(amount) {
            Ok(())
        } else {
            Err(LedgerError::InsufficientFunds {
                account_id: self.id,
                required: amount.value(),
                available: self.balance,
            })
        }
    }

    /// Apply a settled record to the balance.
    ///
    /// Debits are checked against the current balance so settlement can never
    /// take an account negative. Credits may not grow the balance past what the
    /// money column holds. The balance is untouched on error.
    pub fn apply(&mut self, txn: &Transaction) -> LedgerResult<()> {
        debug_assert_eq!(txn.account_id, self.id);

        let balance = match txn.transaction_type {
            TransactionType::Credit => self
                .balance
                .checked_add(txn.amount)
                .filter(|b| fits_money_column(*b))
                .ok_or(LedgerError::BalanceOverflow(self.id))?,
            TransactionType::Debit => {
                if self.balance < txn.amount {
                    return Err(LedgerError::InsufficientFunds {
                        account_id: self.id,
                        required: txn.amount,
                        available: self.balance,
                    });
                }
                self.balance
                    .checked_sub(txn.amount)
                    .ok_or(LedgerError::BalanceOverflow(self.id))?
            }
        };
        self.balance = balance;
        self.updated_at = now();
        Ok(())
    }

    /// Retire the account.
    pub fn retire(&mut self) {
        let retired_at = now();
        self.deleted_at = Some(retired_at);
        self.updated_at = retired_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::NewTransaction;
    use corebank_common::TransactionId;
    use rust_decimal_macros::dec;

    fn settled(txn: NewTransaction) -> Transaction {
        Transaction::from_new(TransactionId::new(), txn, now())
    }

    #[test]
    fn test_apply_credit_and_debit() {
        let mut account = Account::new(UserId::new(), dec!(200));
        let amount = Amount::from_units(100).unwrap();

        account
            .apply(&settled(NewTransaction::debit(account.id, account.id, amount)))
            .unwrap();
        assert_eq!(account.balance, dec!(100));

        account
            .apply(&settled(NewTransaction::credit(account.id, account.id, amount)))
            .unwrap();
        assert_eq!(account.balance, dec!(200));
    }

    #[test]
    fn test_debit_cannot_overdraw() {
        let mut account = Account::new(UserId::new(), dec!(50));
        let amount = Amount::from_units(100).unwrap();

        let err = account
            .apply(&settled(NewTransaction::debit(account.id, account.id, amount)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(account.balance, dec!(50));
    }

    #[test]
    fn test_credit_cannot_overflow_money_column() {
        let mut account = Account::new(UserId::new(), dec!(9999999999999999));
        let amount = Amount::from_units(1).unwrap();

        let err = account
            .apply(&settled(NewTransaction::credit(account.id, account.id, amount)))
            .unwrap_err();
        assert_eq!(err, LedgerError::BalanceOverflow(account.id));
        assert_eq!(account.balance, dec!(9999999999999999));
    }

    #[test]
    fn test_retire() {
        let mut account = Account::new(UserId::new(), Decimal::ZERO);
        assert!(account.is_active());
        account.retire();
        assert!(!account.is_active());
    }
}
