pub mod config;
pub mod decimal;
pub mod eligibility;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod loan;
pub mod loan_book;
pub mod payments;
pub mod penalty;
pub mod restructure;
pub mod schedule;
pub mod serialization;
pub mod settlement;
pub mod types;

// re-export key types
pub use config::{EngineConfig, LedgerConfig, LoanProduct, SettlementConfig};
pub use decimal::{Money, Rate};
pub use eligibility::{DenialReason, Eligibility, EligibilityEvaluator, ExistingLoan};
pub use errors::{ErrorKind, LedgerError, Result};
pub use events::{Event, EventStore};
pub use ledger::{ApplyOutcome, BalanceAccount, BalanceLedger, Decline, LedgerEntry, LedgerReason, LockedAccount};
pub use loan::{LoanAccount, RepaymentPlan};
pub use loan_book::{ApplicationDecision, LoanApplication, LoanBook, RefreshSummary};
pub use payments::{
    Allocation, AllocationComponent, AllocationEngine, AllocationLine, RepaymentReceipt, RepaymentTransaction,
};
pub use penalty::{PenaltyCalculation, PenaltyConfig, PenaltyEngine};
pub use restructure::{RestructureOutcome, RestructureProcessor, RestructureRequest, Waiver};
pub use schedule::{
    instalment_count, InstalmentSchedule, InstalmentScheduleEntry, LoanTerms, RepaymentFrequency, ScheduleGenerator,
    ScheduleRequest,
};
pub use serialization::LoanStatement;
pub use settlement::{
    CallbackPayload, GatewayError, GatewayStatus, MobileMoneyGateway, PendingSettlement, PhoneNumber, PollSummary,
    ResolutionPath, SettlementCoordinator, SettlementEffect, SettlementOutcome, SettlementRequest, SettlementState,
};
pub use types::{
    AccountId, AccountKind, IdempotencyKey, InstalmentStatus, InterestMethod, LoanId, LoanStatus, MemberId,
    PaymentSource, ProductId,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
