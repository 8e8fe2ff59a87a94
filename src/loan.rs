use chrono::{DateTime, Utc};

use crate::decimal::Money;
use crate::eligibility::ExistingLoan;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::payments::{Allocation, AllocationComponent, AllocationEngine, RepaymentTransaction};
use crate::restructure::RestructureOutcome;
use crate::schedule::{
    InstalmentSchedule, InstalmentScheduleEntry, LoanTerms, ScheduleGenerator, ScheduleRequest, ScheduleTotals,
};
use crate::types::{
    AccountId, IdempotencyKey, InstalmentStatus, LoanId, LoanStatus, MemberId, PaymentSource, ProductId,
};

/// a repayment worked out against a copy of the schedule, not yet committed
#[derive(Debug, Clone)]
pub struct RepaymentPlan {
    pub allocation: Allocation,
    pub schedule: InstalmentSchedule,
}

impl RepaymentPlan {
    pub fn applied(&self) -> Money {
        self.allocation.total_applied()
    }
}

/// core loan aggregate
#[derive(Debug)]
pub struct LoanAccount {
    pub id: LoanId,
    pub member_id: MemberId,
    pub product_id: ProductId,
    pub principal: Money,
    pub terms: LoanTerms,
    pub status: LoanStatus,
    /// ledger account mirroring the outstanding balance
    pub outstanding_account: AccountId,
    pub disbursement_account: Option<AccountId>,
    pub applied_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub disbursed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub restructure_count: u32,
    schedule: InstalmentSchedule,
    transactions: Vec<RepaymentTransaction>,
    events: EventStore,
}

impl LoanAccount {
    /// create a pending loan from an accepted application
    pub fn new(
        id: LoanId,
        member_id: MemberId,
        product_id: ProductId,
        principal: Money,
        terms: LoanTerms,
        outstanding_account: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !principal.is_positive() {
            return Err(LedgerError::InvalidPrincipal { amount: principal });
        }
        terms.validate()?;

        let mut loan = Self {
            id,
            member_id,
            product_id,
            principal,
            terms,
            status: LoanStatus::Pending,
            outstanding_account,
            disbursement_account: None,
            applied_at: now,
            approved_at: None,
            disbursed_at: None,
            closed_at: None,
            restructure_count: 0,
            schedule: InstalmentSchedule::new(),
            transactions: Vec::new(),
            events: EventStore::new(),
        };

        loan.events.emit(Event::LoanApplied {
            loan_id: id,
            member_id,
            product_id,
            principal,
            term_months: terms.term_months,
            timestamp: now,
        });

        Ok(loan)
    }

    pub fn schedule(&self) -> &InstalmentSchedule {
        &self.schedule
    }

    pub fn transactions(&self) -> &[RepaymentTransaction] {
        &self.transactions
    }

    pub fn transaction_by_key(&self, key: &IdempotencyKey) -> Option<&RepaymentTransaction> {
        self.transactions.iter().find(|t| &t.idempotency_key == key)
    }

    /// derived from the schedule, never stored
    pub fn outstanding_balance(&self) -> Money {
        self.schedule.outstanding()
    }

    /// whether the ledger account is expected to carry the outstanding balance
    pub fn is_booked(&self) -> bool {
        self.disbursed_at.is_some()
    }

    pub fn has_overdue(&self) -> bool {
        self.schedule.has_overdue()
    }

    /// oldest overdue live entry
    pub fn oldest_overdue(&self) -> Option<&InstalmentScheduleEntry> {
        self.schedule
            .active()
            .into_iter()
            .find(|e| e.status == InstalmentStatus::Overdue)
    }

    pub fn summary(&self) -> ExistingLoan {
        ExistingLoan {
            loan_id: self.id,
            product_id: self.product_id,
            status: self.status,
            has_overdue: self.has_overdue(),
        }
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.take_events()
    }

    fn require_status(&self, allowed: &[LoanStatus], expected: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(LedgerError::InvalidLoanState {
                current: self.status,
                expected: expected.to_string(),
            })
        }
    }

    fn can_transition(from: LoanStatus, to: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (from, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Disbursed)
                | (Approved, Rejected)
                | (Disbursed, Defaulted)
                | (Disbursed, Restructured)
                | (Disbursed, Paid)
                | (Defaulted, Restructured)
                | (Defaulted, Paid)
                | (Restructured, Defaulted)
                | (Restructured, Paid)
                | (Paid, Completed)
        )
    }

    /// move to `new_status`, emitting a status change; same-status is a no-op
    pub fn transition(&mut self, new_status: LoanStatus, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status == new_status {
            return Ok(());
        }
        if !Self::can_transition(self.status, new_status) {
            return Err(LedgerError::InvalidLoanState {
                current: self.status,
                expected: format!("a status that can move to {:?}", new_status),
            });
        }

        let old_status = self.status;
        self.status = new_status;
        self.events.emit(Event::StatusChanged {
            loan_id: self.id,
            old_status,
            new_status,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    fn generate_schedule(&mut self, start: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let request = ScheduleRequest::new(self.principal, self.terms, start);
        let entries = ScheduleGenerator::generate(&request)?;
        self.emit_schedule(&entries, now);
        self.schedule = InstalmentSchedule::from_entries(entries);
        Ok(())
    }

    fn emit_schedule(&mut self, entries: &[InstalmentScheduleEntry], now: DateTime<Utc>) {
        if let Some(first) = entries.first() {
            let totals = ScheduleTotals::of(entries);
            self.events.emit(Event::ScheduleGenerated {
                loan_id: self.id,
                first_sequence: first.sequence,
                instalments: totals.instalments as u32,
                first_due: first.due_date.date_naive(),
                total_due: entries.iter().map(|e| e.total_due()).sum(),
                timestamp: now,
            });
        }
    }

    /// approve and build the provisional schedule from today
    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[LoanStatus::Pending], "pending")?;
        self.generate_schedule(now, now)?;
        self.approved_at = Some(now);
        self.transition(LoanStatus::Approved, "application approved", now)?;
        self.events.emit(Event::LoanApproved {
            loan_id: self.id,
            timestamp: now,
        });
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[LoanStatus::Pending, LoanStatus::Approved], "pending or approved")?;
        self.schedule = InstalmentSchedule::new();
        self.closed_at = Some(now);
        self.transition(LoanStatus::Rejected, reason, now)?;
        self.events.emit(Event::LoanRejected {
            loan_id: self.id,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    /// re-anchor the schedule on the disbursement date and return the amount to book
    pub fn prepare_disbursement(&mut self, now: DateTime<Utc>) -> Result<Money> {
        self.require_status(&[LoanStatus::Approved], "approved")?;
        let anchored = self.schedule.entries().first().map(|e| e.due_date) == Some(self.terms.frequency.due_date(now, 1));
        if !anchored {
            self.generate_schedule(now, now)?;
        }
        Ok(self.outstanding_balance())
    }

    pub fn mark_disbursed(&mut self, into_account: AccountId, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[LoanStatus::Approved], "approved")?;
        self.disbursement_account = Some(into_account);
        self.disbursed_at = Some(now);
        self.transition(LoanStatus::Disbursed, "funds released", now)?;
        self.events.emit(Event::LoanDisbursed {
            loan_id: self.id,
            into_account,
            principal: self.principal,
            outstanding: self.outstanding_balance(),
            timestamp: now,
        });
        Ok(())
    }

    /// work out a repayment without touching the loan.
    ///
    /// Paid loans accept money too: all of it comes back as excess.
    pub fn plan_repayment(&self, amount: Money, as_of: DateTime<Utc>) -> Result<RepaymentPlan> {
        if !(self.status.accepts_repayment() || self.status == LoanStatus::Paid) {
            return Err(LedgerError::InvalidLoanState {
                current: self.status,
                expected: "disbursed, defaulted, restructured or paid".to_string(),
            });
        }

        let mut schedule = self.schedule.clone();
        schedule.refresh_statuses(as_of);
        let allocation = AllocationEngine::allocate(amount, schedule.entries())?;
        schedule.apply_allocation(&allocation, as_of)?;

        let expected = self.outstanding_balance() - allocation.total_applied();
        if schedule.outstanding() != expected {
            return Err(LedgerError::invariant(format!(
                "repayment leaves {} outstanding, expected {}",
                schedule.outstanding(),
                expected
            )));
        }

        Ok(RepaymentPlan { allocation, schedule })
    }

    /// commit a planned repayment once the ledger has taken it
    pub fn commit_repayment(
        &mut self,
        plan: RepaymentPlan,
        source: PaymentSource,
        key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<RepaymentTransaction> {
        let tx = RepaymentTransaction::new(self.id, &plan.allocation, source, key.clone(), now);
        self.schedule = plan.schedule;
        self.transactions.push(tx.clone());

        if tx.applied.is_positive() {
            self.events.emit(Event::RepaymentApplied {
                loan_id: self.id,
                amount: tx.applied,
                applied_to_penalty: plan.allocation.total_to(AllocationComponent::Penalty),
                applied_to_interest: plan.allocation.total_to(AllocationComponent::Interest),
                applied_to_principal: plan.allocation.total_to(AllocationComponent::Principal),
                idempotency_key: key.clone(),
                timestamp: now,
            });
        }
        if tx.unapplied_excess.is_positive() {
            self.events.emit(Event::ExcessReturned {
                loan_id: self.id,
                amount: tx.unapplied_excess,
                idempotency_key: key,
                timestamp: now,
            });
        }

        if self.outstanding_balance().is_zero() && self.status.accepts_repayment() {
            self.transition(LoanStatus::Paid, "outstanding balance cleared", now)?;
        }

        Ok(tx)
    }

    /// swap in a restructured schedule
    pub fn commit_restructure(
        &mut self,
        outcome: &RestructureOutcome,
        terms: LoanTerms,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require_status(
            &[LoanStatus::Disbursed, LoanStatus::Defaulted, LoanStatus::Restructured],
            "disbursed, defaulted or restructured",
        )?;

        let new_entries: Vec<InstalmentScheduleEntry> = outcome
            .schedule
            .entries()
            .iter()
            .filter(|e| e.sequence >= outcome.first_new_sequence)
            .cloned()
            .collect();

        self.schedule = outcome.schedule.clone();
        self.terms = terms;
        self.restructure_count += 1;

        self.events.emit(Event::LoanRestructured {
            loan_id: self.id,
            superseded: outcome.superseded.clone(),
            remaining_principal: outcome.remaining_principal,
            carried_interest: outcome.carried_interest,
            carried_penalty: outcome.carried_penalty,
            released_interest: outcome.released_interest,
            waived: outcome.waived,
            outstanding_before: outcome.outstanding_before,
            outstanding_after: outcome.outstanding_after,
            timestamp: now,
        });
        self.emit_schedule(&new_entries, now);

        // a re-restructure keeps the status and emits no change
        self.transition(LoanStatus::Restructured, "schedule rebuilt on new terms", now)
    }

    /// recompute every live entry status as of the given date
    pub fn refresh_statuses(&mut self, as_of: DateTime<Utc>) {
        self.schedule.refresh_statuses(as_of);
    }

    /// add a one-time late penalty to an entry
    pub fn charge_penalty(&mut self, sequence: u32, amount: Money, days_overdue: u32, now: DateTime<Utc>) -> Result<()> {
        let entry = self
            .schedule
            .get_mut(sequence)
            .ok_or_else(|| LedgerError::invariant(format!("penalty for unknown entry {}", sequence)))?;
        if entry.is_superseded() || entry.penalised {
            return Err(LedgerError::invariant(format!("entry {} cannot take a penalty", sequence)));
        }

        entry.penalty_due += amount;
        entry.penalised = true;
        self.events.emit(Event::PenaltyApplied {
            loan_id: self.id,
            sequence,
            amount,
            days_overdue,
            timestamp: now,
        });
        Ok(())
    }

    /// close a paid loan
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[LoanStatus::Paid], "paid")?;
        if !self.outstanding_balance().is_zero() {
            return Err(LedgerError::invariant(format!(
                "paid loan {} still shows {} outstanding",
                self.id,
                self.outstanding_balance()
            )));
        }
        self.closed_at = Some(now);
        self.transition(LoanStatus::Completed, "loan closed", now)
    }
}
