//! Loan lifecycle service.
//!
//! Lock order is always the loan-outstanding account row first, then the
//! loan record. Nothing here holds two account rows at once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hourglass_rs::SafeTimeProvider;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::LoanProduct;
use crate::decimal::Money;
use crate::eligibility::{DenialReason, Eligibility, EligibilityEvaluator, ExistingLoan};
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::ledger::{ApplyOutcome, BalanceLedger, LedgerReason, LockedAccount};
use crate::loan::LoanAccount;
use crate::payments::RepaymentReceipt;
use crate::penalty::PenaltyEngine;
use crate::restructure::{RestructureOutcome, RestructureProcessor, RestructureRequest, Waiver};
use crate::schedule::{InstalmentSchedule, LoanTerms, RepaymentFrequency};
use crate::serialization::LoanStatement;
use crate::types::{
    AccountId, AccountKind, IdempotencyKey, InstalmentStatus, LoanId, LoanStatus, MemberId, PaymentSource,
};

/// a member's request for a loan on a product
#[derive(Debug, Clone, PartialEq)]
pub struct LoanApplication {
    pub member_id: MemberId,
    pub principal: Money,
    pub term_months: u32,
    /// overrides the product's frequency when set
    pub frequency: Option<RepaymentFrequency>,
}

impl LoanApplication {
    pub fn new(member_id: MemberId, principal: Money, term_months: u32) -> Self {
        Self {
            member_id,
            principal,
            term_months,
            frequency: None,
        }
    }

    pub fn with_frequency(mut self, frequency: RepaymentFrequency) -> Self {
        self.frequency = Some(frequency);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationDecision {
    Accepted(LoanId),
    Declined(Vec<DenialReason>),
}

/// what one `refresh` pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub loans_checked: usize,
    pub overdue_entries: usize,
    pub penalties_charged: usize,
    pub penalty_total: Money,
    pub defaulted: Vec<LoanId>,
    /// loans that hit an error and are left for the next pass
    pub skipped: Vec<LoanId>,
}

struct LoanRecord {
    product: LoanProduct,
    outstanding_account: AccountId,
    member_id: MemberId,
    loan: Mutex<LoanAccount>,
}

impl LoanRecord {
    fn lock(&self) -> MutexGuard<'_, LoanAccount> {
        self.loan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// composes eligibility, scheduling, allocation and the ledger into loan operations
pub struct LoanBook {
    ledger: Arc<BalanceLedger>,
    loans: DashMap<LoanId, Arc<LoanRecord>>,
    applications: DashMap<MemberId, Arc<Mutex<()>>>,
    time: Arc<SafeTimeProvider>,
    events: Mutex<EventStore>,
}

impl LoanBook {
    pub fn new(ledger: Arc<BalanceLedger>, time: Arc<SafeTimeProvider>) -> Self {
        Self {
            ledger,
            loans: DashMap::new(),
            applications: DashMap::new(),
            time,
            events: Mutex::new(EventStore::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    /// open a member balance account
    pub fn open_account(&self, member_id: MemberId, kind: AccountKind) -> AccountId {
        self.ledger.open_account(member_id, kind)
    }

    fn record(&self, loan_id: LoanId) -> Result<Arc<LoanRecord>> {
        self.loans
            .get(&loan_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(LedgerError::LoanNotFound { id: loan_id })
    }

    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).emit(event);
    }

    fn collect(&self, loan: &mut LoanAccount) {
        let drained = loan.take_events();
        self.events.lock().unwrap_or_else(PoisonError::into_inner).extend(drained);
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take_events()
    }

    /// the loan-outstanding account backing a loan
    pub fn outstanding_account(&self, loan_id: LoanId) -> Result<AccountId> {
        Ok(self.record(loan_id)?.outstanding_account)
    }

    /// read access to a loan
    pub fn inspect<R>(&self, loan_id: LoanId, f: impl FnOnce(&LoanAccount) -> R) -> Result<R> {
        let record = self.record(loan_id)?;
        let loan = record.lock();
        Ok(f(&loan))
    }

    pub fn status(&self, loan_id: LoanId) -> Result<LoanStatus> {
        self.inspect(loan_id, |l| l.status)
    }

    pub fn outstanding(&self, loan_id: LoanId) -> Result<Money> {
        self.inspect(loan_id, |l| l.outstanding_balance())
    }

    pub fn schedule(&self, loan_id: LoanId) -> Result<InstalmentSchedule> {
        self.inspect(loan_id, |l| l.schedule().clone())
    }

    /// summaries of every loan a member holds, with entry statuses as of now
    pub fn loans_of(&self, member_id: MemberId) -> Vec<ExistingLoan> {
        let now = self.time.now();
        let records: Vec<Arc<LoanRecord>> = self
            .loans
            .iter()
            .filter(|r| r.value().member_id == member_id)
            .map(|r| Arc::clone(r.value()))
            .collect();
        records
            .iter()
            .map(|r| {
                let mut loan = r.lock();
                loan.refresh_statuses(now);
                loan.summary()
            })
            .collect()
    }

    /// evaluate eligibility and open a pending loan
    #[instrument(
        name = "loan_book.apply",
        skip_all,
        fields(member_id = %application.member_id, product = %product.name, principal = %application.principal),
        err
    )]
    pub fn apply(&self, application: LoanApplication, product: &LoanProduct) -> Result<ApplicationDecision> {
        product.validate()?;
        let mut terms = product.terms(application.term_months);
        if let Some(frequency) = application.frequency {
            terms.frequency = frequency;
        }
        if !application.principal.is_positive() {
            return Err(LedgerError::InvalidPrincipal {
                amount: application.principal,
            });
        }
        terms.validate()?;

        // one application per member at a time, so two cannot both pass the rules
        let gate = Arc::clone(
            self.applications
                .entry(application.member_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _gate = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.time.now();
        let existing = self.loans_of(application.member_id);
        if let Eligibility::Deny(reasons) = EligibilityEvaluator::evaluate(&existing, product) {
            warn!(reasons = reasons.len(), "application declined");
            self.emit(Event::LoanDeclined {
                member_id: application.member_id,
                product_id: product.id,
                reasons: reasons.clone(),
                timestamp: now,
            });
            return Ok(ApplicationDecision::Declined(reasons));
        }

        let loan_id = Uuid::new_v4();
        let outstanding_account = self.ledger.open_account(application.member_id, AccountKind::LoanOutstanding);
        let mut loan = LoanAccount::new(
            loan_id,
            application.member_id,
            product.id,
            application.principal,
            terms,
            outstanding_account,
            now,
        )?;
        self.collect(&mut loan);

        self.loans.insert(
            loan_id,
            Arc::new(LoanRecord {
                product: product.clone(),
                outstanding_account,
                member_id: application.member_id,
                loan: Mutex::new(loan),
            }),
        );

        info!(loan_id = %loan_id, "application accepted");
        Ok(ApplicationDecision::Accepted(loan_id))
    }

    #[instrument(name = "loan_book.approve", skip(self), err)]
    pub fn approve(&self, loan_id: LoanId) -> Result<()> {
        let record = self.record(loan_id)?;
        let mut loan = record.lock();
        let result = loan.approve(self.time.now());
        self.collect(&mut loan);
        result
    }

    #[instrument(name = "loan_book.reject", skip(self), err)]
    pub fn reject(&self, loan_id: LoanId, reason: &str) -> Result<()> {
        let record = self.record(loan_id)?;
        let mut loan = record.lock();
        let result = loan.reject(reason, self.time.now());
        self.collect(&mut loan);
        result
    }

    /// book the loan and pay the principal into a member account.
    ///
    /// Both legs are keyed on the loan id, so a disbursement that failed
    /// after booking can be retried with the same account.
    #[instrument(name = "loan_book.disburse", skip(self), err)]
    pub fn disburse(&self, loan_id: LoanId, into_account: AccountId) -> Result<Money> {
        let record = self.record(loan_id)?;
        if !self.ledger.contains(into_account) {
            return Err(LedgerError::AccountNotFound { id: into_account });
        }

        let (principal, outstanding) = {
            let locked = self.ledger.lock(record.outstanding_account)?;
            let mut loan = record.lock();

            if loan.status == LoanStatus::Approved {
                let now = self.time.now();
                let outstanding = loan.prepare_disbursement(now)?;
                let key = IdempotencyKey::new(format!("disburse:{}", loan_id));
                expect_applied(locked.apply(outstanding, LedgerReason::Disbursement, &key)?)?;
                loan.mark_disbursed(into_account, now)?;
                self.collect(&mut loan);
            } else if loan.disbursement_account != Some(into_account) {
                return Err(LedgerError::InvalidLoanState {
                    current: loan.status,
                    expected: "approved".to_string(),
                });
            }
            (loan.principal, loan.outstanding_balance())
        };

        let key = IdempotencyKey::new(format!("disburse:{}:credit", loan_id));
        expect_applied(self.ledger.apply(into_account, principal, LedgerReason::Disbursement, &key)?)?;

        info!(%principal, %outstanding, "loan disbursed");
        Ok(outstanding)
    }

    /// apply a repayment; any excess is returned on the receipt for the caller to route
    #[instrument(
        name = "loan_book.repay",
        skip(self, source),
        fields(amount = %amount, key = %key),
        err
    )]
    pub fn repay(
        &self,
        loan_id: LoanId,
        amount: Money,
        source: PaymentSource,
        key: IdempotencyKey,
    ) -> Result<RepaymentReceipt> {
        let record = self.record(loan_id)?;
        let locked = self.ledger.lock(record.outstanding_account)?;
        self.repay_locked(&record, &locked, amount, source, key)
    }

    /// repayment under an already-held loan-outstanding row lock
    pub(crate) fn repay_with_lock(
        &self,
        loan_id: LoanId,
        locked: &LockedAccount<'_>,
        amount: Money,
        source: PaymentSource,
        key: IdempotencyKey,
    ) -> Result<RepaymentReceipt> {
        let record = self.record(loan_id)?;
        if locked.id() != record.outstanding_account {
            return Err(LedgerError::invariant(format!(
                "repayment of loan {} under the lock of account {}",
                loan_id,
                locked.id()
            )));
        }
        self.repay_locked(&record, locked, amount, source, key)
    }

    fn repay_locked(
        &self,
        record: &LoanRecord,
        locked: &LockedAccount<'_>,
        amount: Money,
        source: PaymentSource,
        key: IdempotencyKey,
    ) -> Result<RepaymentReceipt> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount { amount });
        }

        let mut loan = record.lock();
        if let Some(prior) = loan.transaction_by_key(&key) {
            debug!(loan_id = %loan.id, %key, "repayment already applied");
            return Ok(RepaymentReceipt::from_transaction(prior, loan.outstanding_balance(), true));
        }
        if amount.is_zero() {
            return Ok(RepaymentReceipt::noop(loan.id, loan.outstanding_balance()));
        }

        let ledger_balance = locked.balance();
        if loan.is_booked() && ledger_balance != loan.outstanding_balance() {
            return Err(LedgerError::invariant(format!(
                "loan {} schedule shows {} but its ledger account holds {}",
                loan.id,
                loan.outstanding_balance(),
                ledger_balance
            )));
        }

        let now = self.time.now();
        let plan = loan.plan_repayment(amount, now)?;
        let applied = plan.applied();
        if applied.is_positive() {
            expect_applied(locked.apply(-applied, LedgerReason::Repayment, &key)?)?;
        }

        let tx = loan.commit_repayment(plan, source, key, now)?;
        self.collect(&mut loan);

        let outstanding = loan.outstanding_balance();
        info!(loan_id = %loan.id, applied = %tx.applied, excess = %tx.unapplied_excess, %outstanding, "repayment applied");
        Ok(RepaymentReceipt::from_transaction(&tx, outstanding, false))
    }

    /// rebuild the forward schedule on new terms
    #[instrument(name = "loan_book.restructure", skip(self, terms, waiver), err)]
    pub fn restructure(&self, loan_id: LoanId, terms: LoanTerms, waiver: Waiver) -> Result<RestructureOutcome> {
        let record = self.record(loan_id)?;
        let locked = self.ledger.lock(record.outstanding_account)?;
        let mut loan = record.lock();

        if !matches!(
            loan.status,
            LoanStatus::Disbursed | LoanStatus::Defaulted | LoanStatus::Restructured
        ) {
            return Err(LedgerError::InvalidLoanState {
                current: loan.status,
                expected: "disbursed, defaulted or restructured".to_string(),
            });
        }
        if !loan.outstanding_balance().is_positive() {
            return Err(LedgerError::NothingOutstanding { id: loan_id });
        }

        let now = self.time.now();
        let request = RestructureRequest {
            as_of: now,
            terms,
            waiver,
        };
        let mut current = loan.schedule().clone();
        current.refresh_statuses(now);
        let outcome = RestructureProcessor::restructure(&current, &request)?;

        let delta = outcome.outstanding_delta();
        if !delta.is_zero() {
            let key = IdempotencyKey::new(format!("restructure:{}:{}", loan_id, loan.restructure_count + 1));
            expect_applied(locked.apply(delta, LedgerReason::Restructure, &key)?)?;
        }

        loan.commit_restructure(&outcome, terms, now)?;
        self.collect(&mut loan);

        info!(
            remaining_principal = %outcome.remaining_principal,
            carried = %(outcome.carried_interest + outcome.carried_penalty),
            waived = %outcome.waived,
            "loan restructured"
        );
        Ok(outcome)
    }

    /// overdue refresh job: entry statuses, late penalties and default marking.
    ///
    /// A loan that fails (a busy ledger row, say) is logged and listed in
    /// `skipped`; the rest of the pass still runs. Penalty keys make a rerun
    /// safe for loans that were already charged.
    #[instrument(name = "loan_book.refresh", skip(self))]
    pub fn refresh(&self, as_of: DateTime<Utc>) -> RefreshSummary {
        let records: Vec<(LoanId, Arc<LoanRecord>)> = self
            .loans
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();

        let mut summary = RefreshSummary::default();
        for (loan_id, record) in records {
            if let Err(err) = self.refresh_loan(loan_id, &record, as_of, &mut summary) {
                warn!(loan_id = %loan_id, error = %err, "loan refresh skipped");
                summary.skipped.push(loan_id);
            }
        }

        info!(
            loans = summary.loans_checked,
            overdue = summary.overdue_entries,
            penalties = summary.penalties_charged,
            defaulted = summary.defaulted.len(),
            skipped = summary.skipped.len(),
            "refresh complete"
        );
        summary
    }

    fn refresh_loan(
        &self,
        loan_id: LoanId,
        record: &LoanRecord,
        as_of: DateTime<Utc>,
        summary: &mut RefreshSummary,
    ) -> Result<()> {
        let locked = self.ledger.lock(record.outstanding_account)?;
        let mut loan = record.lock();
        if !loan.status.accepts_repayment() {
            return Ok(());
        }
        summary.loans_checked += 1;
        loan.refresh_statuses(as_of);

        let result = Self::charge_and_mark(loan_id, record, &locked, &mut loan, as_of, summary);
        self.collect(&mut loan);
        result
    }

    fn charge_and_mark(
        loan_id: LoanId,
        record: &LoanRecord,
        locked: &LockedAccount<'_>,
        loan: &mut LoanAccount,
        as_of: DateTime<Utc>,
        summary: &mut RefreshSummary,
    ) -> Result<()> {
        if let Some(config) = &record.product.penalty {
            let charges = PenaltyEngine::new(config).assess(loan.schedule().active(), as_of);
            for charge in charges {
                let key = IdempotencyKey::new(format!("penalty:{}:{}", loan_id, charge.sequence));
                expect_applied(locked.apply(charge.penalty_amount, LedgerReason::Penalty, &key)?)?;
                loan.charge_penalty(charge.sequence, charge.penalty_amount, charge.days_overdue, as_of)?;
                summary.penalties_charged += 1;
                summary.penalty_total += charge.penalty_amount;
            }
        }

        summary.overdue_entries += loan
            .schedule()
            .active()
            .iter()
            .filter(|e| e.status == InstalmentStatus::Overdue)
            .count();

        let oldest = loan.oldest_overdue().map(|e| (e.sequence, e.days_overdue(as_of)));
        if let (Some(limit), Some((sequence, days))) = (record.product.default_after_days, oldest) {
            if days >= limit && loan.status != LoanStatus::Defaulted {
                loan.transition(
                    LoanStatus::Defaulted,
                    &format!("instalment {} is {} days past due", sequence, days),
                    as_of,
                )?;
                warn!(loan_id = %loan_id, days, "loan defaulted");
                summary.defaulted.push(loan_id);
            }
        }
        Ok(())
    }

    /// close a paid loan
    #[instrument(name = "loan_book.close", skip(self), err)]
    pub fn close(&self, loan_id: LoanId) -> Result<()> {
        let record = self.record(loan_id)?;
        let locked = self.ledger.lock(record.outstanding_account)?;
        let mut loan = record.lock();
        if !locked.balance().is_zero() {
            return Err(LedgerError::invariant(format!(
                "loan {} ledger account still holds {}",
                loan_id,
                locked.balance()
            )));
        }
        let result = loan.close(self.time.now());
        self.collect(&mut loan);
        result
    }

    pub fn statement(&self, loan_id: LoanId) -> Result<LoanStatement> {
        let record = self.record(loan_id)?;
        let loan = record.lock();
        Ok(LoanStatement::from_loan(&loan, &record.product.name, self.time.now()))
    }

    /// check schedule outstanding against the loan's ledger account
    pub fn verify(&self, loan_id: LoanId) -> Result<Money> {
        let record = self.record(loan_id)?;
        let locked = self.ledger.lock(record.outstanding_account)?;
        let loan = record.lock();

        let outstanding = loan.outstanding_balance();
        let expected = if loan.is_booked() { outstanding } else { Money::ZERO };
        let booked = locked.balance();
        if booked != expected {
            return Err(LedgerError::invariant(format!(
                "loan {} outstanding {} but ledger holds {}",
                loan_id, expected, booked
            )));
        }
        drop(loan);
        drop(locked);

        self.ledger.reconcile(record.outstanding_account)?;
        Ok(outstanding)
    }
}

/// a positive mutation on the loan's own account can only apply or replay
fn expect_applied(outcome: ApplyOutcome) -> Result<()> {
    match outcome {
        ApplyOutcome::Applied(_) | ApplyOutcome::Replayed(_) => Ok(()),
        ApplyOutcome::Declined(decline) => Err(LedgerError::invariant(format!(
            "loan ledger mutation declined: {}",
            decline
        ))),
    }
}
