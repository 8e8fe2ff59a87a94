use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// unique identifier for a loan
pub type LoanId = Uuid;

/// unique identifier for a member (owner of loans and balance accounts)
pub type MemberId = Uuid;

/// unique identifier for a balance account
pub type AccountId = Uuid;

/// unique identifier for a loan product
pub type ProductId = Uuid;

/// loan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    /// application accepted, awaiting approval
    Pending,
    /// schedule generated, not yet disbursed
    Approved,
    /// funds released, repayments expected
    Disbursed,
    /// seriously past due
    Defaulted,
    /// schedule rebuilt on new terms
    Restructured,
    /// closed after full repayment
    Completed,
    /// application turned down
    Rejected,
    /// outstanding balance cleared
    Paid,
}

impl LoanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoanStatus::Completed | LoanStatus::Rejected)
    }

    /// statuses in which the member still carries the loan
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            LoanStatus::Pending
                | LoanStatus::Approved
                | LoanStatus::Disbursed
                | LoanStatus::Defaulted
                | LoanStatus::Restructured
        )
    }

    /// statuses in which repayments are accepted
    pub fn accepts_repayment(&self) -> bool {
        matches!(
            self,
            LoanStatus::Disbursed | LoanStatus::Defaulted | LoanStatus::Restructured
        )
    }
}

/// instalment entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstalmentStatus {
    Upcoming,
    Due,
    Overdue,
    Paid,
    PartiallyPaid,
    Superseded,
}

/// interest calculation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestMethod {
    /// interest on the original principal for the whole term
    Flat,
    /// interest on the outstanding principal each period
    ReducingBalance,
}

/// kind of member balance account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Savings,
    Shares,
    Deposit,
    LoanOutstanding,
}

/// where a repayment came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PaymentSource {
    Cash,
    Teller { teller_id: String },
    MobileMoney { reference: String },
}

/// idempotency key supplied by a caller or derived from an external event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// derive a secondary key, e.g. for the excess leg of a repayment
    pub fn derive(&self, suffix: &str) -> Self {
        Self(format!("{}:{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
