use thiserror::Error;

use crate::decimal::{Money, Rate};
use crate::settlement::SettlementState;
use crate::types::{AccountId, LoanId, LoanStatus};

/// coarse error category, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// bad input, rejected before any side effect
    Validation,
    NotFound,
    /// operation not allowed in the current lifecycle state
    InvalidState,
    /// contention or gateway trouble; safe to retry with the same key
    Retryable,
    /// the pending settlement is closed; a new payment attempt is required
    SettlementExpired,
    /// a defect; the operation was aborted without persisting anything
    InvariantViolation,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid principal: {amount}")]
    InvalidPrincipal { amount: Money },

    #[error("invalid term: {term_months} months")]
    InvalidTerm { term_months: u32 },

    #[error("invalid interest rate: {rate}")]
    InvalidInterestRate { rate: Rate },

    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: Money },

    #[error("invalid phone number: {phone}")]
    InvalidPhoneNumber { phone: String },

    #[error("invalid waiver: {message}")]
    InvalidWaiver { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("loan not found: {id}")]
    LoanNotFound { id: LoanId },

    #[error("account not found: {id}")]
    AccountNotFound { id: AccountId },

    #[error("settlement not found: {reference}")]
    SettlementNotFound { reference: String },

    #[error("invalid loan state: current {current:?}, expected {expected}")]
    InvalidLoanState {
        current: LoanStatus,
        expected: String,
    },

    #[error("nothing outstanding on loan {id}")]
    NothingOutstanding { id: LoanId },

    #[error("settlement {reference} already closed in state {state:?}")]
    SettlementClosed {
        reference: String,
        state: SettlementState,
    },

    #[error("callback amount mismatch for {reference}: expected {expected}, received {received}")]
    AmountMismatch {
        reference: String,
        expected: Money,
        received: Money,
    },

    #[error("lock timeout on account {account_id} after {attempts} attempts")]
    LockTimeout { account_id: AccountId, attempts: u32 },

    #[error("gateway unavailable after {attempts} attempts: {message}")]
    GatewayUnavailable { attempts: u32, message: String },

    #[error("gateway rejected request: {message}")]
    GatewayRejected { message: String },

    #[error("settlement {reference} expired")]
    SettlementExpired { reference: String },

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidPrincipal { .. }
            | LedgerError::InvalidTerm { .. }
            | LedgerError::InvalidInterestRate { .. }
            | LedgerError::InvalidAmount { .. }
            | LedgerError::InvalidPhoneNumber { .. }
            | LedgerError::InvalidWaiver { .. }
            | LedgerError::InvalidConfiguration { .. }
            | LedgerError::AmountMismatch { .. } => ErrorKind::Validation,
            LedgerError::LoanNotFound { .. }
            | LedgerError::AccountNotFound { .. }
            | LedgerError::SettlementNotFound { .. } => ErrorKind::NotFound,
            LedgerError::InvalidLoanState { .. }
            | LedgerError::NothingOutstanding { .. }
            | LedgerError::SettlementClosed { .. }
            | LedgerError::GatewayRejected { .. } => ErrorKind::InvalidState,
            LedgerError::LockTimeout { .. } | LedgerError::GatewayUnavailable { .. } => {
                ErrorKind::Retryable
            }
            LedgerError::SettlementExpired { .. } => ErrorKind::SettlementExpired,
            LedgerError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        LedgerError::InvariantViolation {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
