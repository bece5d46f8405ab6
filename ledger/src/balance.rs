//! Account balance reconciliation.

use corebank_common::{now, AccountId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sums of an account's ledger records, split by settlement state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub settled_credits: Decimal,
    pub settled_debits: Decimal,
    pub pending_credits: Decimal,
    pub pending_debits: Decimal,
}

impl LedgerTotals {
    /// Net effect of settled records on the balance.
    pub fn settled_net(&self) -> Decimal {
        self.settled_credits - self.settled_debits
    }
}

/// Account balance at a point in time, reconciled against its ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Settled balance as stored on the account.
    pub balance: Decimal,
    /// Settled credits (captured incoming records).
    pub settled_credits: Decimal,
    /// Settled debits (captured outgoing records).
    pub settled_debits: Decimal,
    /// Pending credits (created, not yet captured).
    pub pending_credits: Decimal,
    /// Pending debits (created, not yet captured).
    pub pending_debits: Decimal,
    /// When this view was taken.
    pub as_of: Timestamp,
}

impl AccountBalance {
    /// Build a view from the stored balance and the ledger totals.
    pub fn new(account_id: AccountId, balance: Decimal, totals: LedgerTotals) -> Self {
        Self {
            account_id,
            balance,
            settled_credits: totals.settled_credits,
            settled_debits: totals.settled_debits,
            pending_credits: totals.pending_credits,
            pending_debits: totals.pending_debits,
            as_of: now(),
        }
    }

    /// Get projected balance (includes pending).
    pub fn projected(&self) -> Decimal {
        self.balance + self.pending_credits - self.pending_debits
    }

    /// Whether the stored balance equals the net of settled records.
    pub fn is_consistent(&self) -> bool {
        self.balance == self.settled_credits - self.settled_debits
    }
}
