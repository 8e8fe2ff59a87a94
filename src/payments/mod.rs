pub mod allocation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;
use crate::types::{IdempotencyKey, LoanId, PaymentSource};

pub use allocation::{Allocation, AllocationComponent, AllocationEngine, AllocationLine};

/// immutable record of one money movement applied to a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepaymentTransaction {
    pub id: Uuid,
    pub loan_id: LoanId,
    pub amount: Money,
    pub applied: Money,
    pub unapplied_excess: Money,
    pub timestamp: DateTime<Utc>,
    pub source: PaymentSource,
    pub idempotency_key: IdempotencyKey,
    pub allocation: Vec<AllocationLine>,
}

impl RepaymentTransaction {
    pub fn new(
        loan_id: LoanId,
        allocation: &Allocation,
        source: PaymentSource,
        idempotency_key: IdempotencyKey,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            amount: allocation.amount,
            applied: allocation.total_applied(),
            unapplied_excess: allocation.unapplied_excess,
            timestamp,
            source,
            idempotency_key,
            allocation: allocation.lines.clone(),
        }
    }

    pub fn to_penalty(&self) -> Money {
        self.allocation.iter().map(|l| l.to_penalty).sum()
    }

    pub fn to_interest(&self) -> Money {
        self.allocation.iter().map(|l| l.to_interest).sum()
    }

    pub fn to_principal(&self) -> Money {
        self.allocation.iter().map(|l| l.to_principal).sum()
    }
}

/// what the caller gets back from a repayment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepaymentReceipt {
    pub loan_id: LoanId,
    /// `None` for a zero-amount payment, which records nothing
    pub transaction_id: Option<Uuid>,
    pub amount: Money,
    pub applied: Money,
    /// not applied to the loan; the caller decides where it goes
    pub unapplied_excess: Money,
    pub outstanding_after: Money,
    /// true when the key had already been applied and nothing changed
    pub replayed: bool,
}

impl RepaymentReceipt {
    pub fn from_transaction(tx: &RepaymentTransaction, outstanding_after: Money, replayed: bool) -> Self {
        Self {
            loan_id: tx.loan_id,
            transaction_id: Some(tx.id),
            amount: tx.amount,
            applied: tx.applied,
            unapplied_excess: tx.unapplied_excess,
            outstanding_after,
            replayed,
        }
    }

    pub fn noop(loan_id: LoanId, outstanding_after: Money) -> Self {
        Self {
            loan_id,
            transaction_id: None,
            amount: Money::ZERO,
            applied: Money::ZERO,
            unapplied_excess: Money::ZERO,
            outstanding_after,
            replayed: false,
        }
    }

    pub fn has_excess(&self) -> bool {
        self.unapplied_excess.is_positive()
    }
}
