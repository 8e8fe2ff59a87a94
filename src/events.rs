use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::eligibility::DenialReason;
use crate::ledger::LedgerReason;
use crate::settlement::{ResolutionPath, SettlementState};
use crate::types::{AccountId, IdempotencyKey, LoanId, LoanStatus, MemberId, ProductId};

/// all events emitted by the ledger, the loan book and the settlement coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // application events
    LoanApplied {
        loan_id: LoanId,
        member_id: MemberId,
        product_id: ProductId,
        principal: Money,
        term_months: u32,
        timestamp: DateTime<Utc>,
    },
    LoanDeclined {
        member_id: MemberId,
        product_id: ProductId,
        reasons: Vec<DenialReason>,
        timestamp: DateTime<Utc>,
    },
    LoanApproved {
        loan_id: LoanId,
        timestamp: DateTime<Utc>,
    },
    LoanRejected {
        loan_id: LoanId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    LoanDisbursed {
        loan_id: LoanId,
        into_account: AccountId,
        principal: Money,
        outstanding: Money,
        timestamp: DateTime<Utc>,
    },

    // schedule events
    ScheduleGenerated {
        loan_id: LoanId,
        first_sequence: u32,
        instalments: u32,
        first_due: NaiveDate,
        total_due: Money,
        timestamp: DateTime<Utc>,
    },
    LoanRestructured {
        loan_id: LoanId,
        superseded: Vec<u32>,
        remaining_principal: Money,
        carried_interest: Money,
        carried_penalty: Money,
        released_interest: Money,
        waived: Money,
        outstanding_before: Money,
        outstanding_after: Money,
        timestamp: DateTime<Utc>,
    },
    PenaltyApplied {
        loan_id: LoanId,
        sequence: u32,
        amount: Money,
        days_overdue: u32,
        timestamp: DateTime<Utc>,
    },

    // repayment events
    RepaymentApplied {
        loan_id: LoanId,
        amount: Money,
        applied_to_penalty: Money,
        applied_to_interest: Money,
        applied_to_principal: Money,
        idempotency_key: IdempotencyKey,
        timestamp: DateTime<Utc>,
    },
    ExcessReturned {
        loan_id: LoanId,
        amount: Money,
        idempotency_key: IdempotencyKey,
        timestamp: DateTime<Utc>,
    },

    // ledger events
    BalanceChanged {
        account_id: AccountId,
        sequence: u64,
        delta: Money,
        balance_after: Money,
        reason: LedgerReason,
        idempotency_key: IdempotencyKey,
        timestamp: DateTime<Utc>,
    },

    // settlement events
    SettlementInitiated {
        reference: String,
        amount: Money,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    SettlementAcknowledged {
        reference: String,
        gateway_tx_id: String,
        timestamp: DateTime<Utc>,
    },
    SettlementConfirmed {
        reference: String,
        amount: Money,
        path: ResolutionPath,
        timestamp: DateTime<Utc>,
    },
    SettlementFailed {
        reference: String,
        result_code: Option<i32>,
        path: ResolutionPath,
        timestamp: DateTime<Utc>,
    },
    SettlementExpired {
        reference: String,
        timestamp: DateTime<Utc>,
    },
    LateConfirmationRejected {
        reference: String,
        state: SettlementState,
        path: ResolutionPath,
        timestamp: DateTime<Utc>,
    },

    // status change events
    StatusChanged {
        loan_id: LoanId,
        old_status: LoanStatus,
        new_status: LoanStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// event store for collecting events during operations
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
