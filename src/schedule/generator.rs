use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::types::InterestMethod;

use super::entry::InstalmentScheduleEntry;
use super::frequency::{instalment_count, RepaymentFrequency};

/// repayment terms of a loan, independent of the amount borrowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanTerms {
    /// annual rate (0.12 = 12% p.a.)
    pub annual_rate: Rate,
    /// always a month count, whatever the frequency
    pub term_months: u32,
    pub frequency: RepaymentFrequency,
    pub interest_method: InterestMethod,
}

impl LoanTerms {
    pub fn new(
        annual_rate: Rate,
        term_months: u32,
        frequency: RepaymentFrequency,
        interest_method: InterestMethod,
    ) -> Self {
        Self {
            annual_rate,
            term_months,
            frequency,
            interest_method,
        }
    }

    pub fn instalment_count(&self) -> u32 {
        instalment_count(self.term_months, self.frequency)
    }

    pub fn periodic_rate(&self) -> Rate {
        self.annual_rate.per_period(self.frequency.periods_per_year())
    }

    pub fn validate(&self) -> Result<()> {
        if self.term_months == 0 {
            return Err(LedgerError::InvalidTerm {
                term_months: self.term_months,
            });
        }
        if !self.annual_rate.is_positive() {
            return Err(LedgerError::InvalidInterestRate {
                rate: self.annual_rate,
            });
        }
        Ok(())
    }
}

/// input to a single schedule generation
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub principal: Money,
    pub terms: LoanTerms,
    /// disbursement (or restructure) date; the first instalment falls one period later
    pub start_date: DateTime<Utc>,
    /// sequence number of the first generated entry
    pub first_sequence: u32,
}

impl ScheduleRequest {
    pub fn new(principal: Money, terms: LoanTerms, start_date: DateTime<Utc>) -> Self {
        Self {
            principal,
            terms,
            start_date,
            first_sequence: 1,
        }
    }

    /// continue numbering after existing history
    pub fn starting_at(mut self, first_sequence: u32) -> Self {
        self.first_sequence = first_sequence;
        self
    }
}

/// builds instalment plans
pub struct ScheduleGenerator {
    method: InterestMethod,
}

impl ScheduleGenerator {
    pub fn new(method: InterestMethod) -> Self {
        Self { method }
    }

    /// generate with the interest method carried by the request's terms
    pub fn generate(request: &ScheduleRequest) -> Result<Vec<InstalmentScheduleEntry>> {
        Self::new(request.terms.interest_method).calculate_schedule(request)
    }

    pub fn calculate_schedule(&self, request: &ScheduleRequest) -> Result<Vec<InstalmentScheduleEntry>> {
        if !request.principal.is_positive() {
            return Err(LedgerError::InvalidPrincipal {
                amount: request.principal,
            });
        }
        request.terms.validate()?;

        let count = request.terms.instalment_count();
        if count == 0 {
            return Err(LedgerError::InvalidTerm {
                term_months: request.terms.term_months,
            });
        }

        match self.method {
            InterestMethod::Flat => Ok(self.calculate_flat(request, count)),
            InterestMethod::ReducingBalance => self.calculate_reducing_balance(request, count),
        }
    }

    /// flat: interest on the original principal over the whole term,
    /// principal and interest spread evenly, final entry absorbs rounding
    fn calculate_flat(&self, request: &ScheduleRequest, count: u32) -> Vec<InstalmentScheduleEntry> {
        let terms = &request.terms;
        let years = Decimal::from(terms.term_months) / Decimal::from(12);
        let total_interest =
            Money::from_decimal(request.principal.as_decimal() * terms.annual_rate.as_decimal() * years);

        let principal_share = request.principal.even_share(count);
        let interest_share = total_interest.even_share(count);
        let preceding = Decimal::from(count - 1);
        let last_principal = request.principal - principal_share * preceding;
        let last_interest = total_interest - interest_share * preceding;

        (1..=count)
            .map(|i| {
                let (principal_due, interest_due) = if i == count {
                    (last_principal, last_interest)
                } else {
                    (principal_share, interest_share)
                };
                InstalmentScheduleEntry::new(
                    request.first_sequence + i - 1,
                    terms.frequency.due_date(request.start_date, i),
                    principal_due,
                    interest_due,
                )
            })
            .collect()
    }

    /// reducing balance: level payment at the periodic rate, interest on the
    /// running balance, final entry clears whatever principal is left
    fn calculate_reducing_balance(
        &self,
        request: &ScheduleRequest,
        count: u32,
    ) -> Result<Vec<InstalmentScheduleEntry>> {
        let terms = &request.terms;
        let rate = terms.periodic_rate().as_decimal();
        let payment = level_payment(request.principal, rate, count)?;

        let mut entries = Vec::with_capacity(count as usize);
        let mut balance = request.principal;

        for i in 1..=count {
            let interest_due = Money::from_decimal(balance.as_decimal() * rate);
            let principal_due = if i == count {
                balance
            } else {
                (payment - interest_due).max(Money::ZERO).min(balance)
            };
            balance -= principal_due;

            entries.push(InstalmentScheduleEntry::new(
                request.first_sequence + i - 1,
                terms.frequency.due_date(request.start_date, i),
                principal_due,
                interest_due,
            ));
        }

        Ok(entries)
    }
}

/// level payment: P * r * (1 + r)^n / ((1 + r)^n - 1)
fn level_payment(principal: Money, rate: Decimal, periods: u32) -> Result<Money> {
    let overflow = || LedgerError::InvalidConfiguration {
        message: format!("rate {} over {} periods overflows the payment calculation", rate, periods),
    };

    let base = Decimal::ONE + rate;
    let mut compound = Decimal::ONE;
    for _ in 0..periods {
        compound = compound.checked_mul(base).ok_or_else(overflow)?;
    }

    let numerator = principal
        .as_decimal()
        .checked_mul(rate)
        .and_then(|v| v.checked_mul(compound))
        .ok_or_else(overflow)?;
    let denominator = compound - Decimal::ONE;
    if denominator.is_zero() {
        return Err(overflow());
    }

    Ok(Money::from_decimal(numerator / denominator))
}

/// principal, interest and instalment totals of a generated plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTotals {
    pub instalments: usize,
    pub principal: Money,
    pub interest: Money,
}

impl ScheduleTotals {
    pub fn of(entries: &[InstalmentScheduleEntry]) -> Self {
        Self {
            instalments: entries.len(),
            principal: entries.iter().map(|e| e.principal_due).sum(),
            interest: entries.iter().map(|e| e.interest_due).sum(),
        }
    }

    pub fn total(&self) -> Money {
        self.principal + self.interest
    }
}
