//! Rebuilds a loan's forward schedule on new terms.
//!
//! Unpaid live entries are superseded, never edited or removed. Interest
//! and penalty already earned (due on or before the restructure date) are
//! carried onto the first new instalment; interest on future instalments is
//! released and replaced by the new terms' interest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::schedule::{InstalmentSchedule, LoanTerms, ScheduleGenerator, ScheduleRequest};

/// interest and penalty the Sacco explicitly forgives at restructure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waiver {
    pub interest: Money,
    pub penalty: Money,
}

impl Waiver {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Money {
        self.interest + self.penalty
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestructureRequest {
    pub as_of: DateTime<Utc>,
    pub terms: LoanTerms,
    pub waiver: Waiver,
}

/// the rebuilt schedule plus an account of where every shilling went
#[derive(Debug, Clone, PartialEq)]
pub struct RestructureOutcome {
    pub schedule: InstalmentSchedule,
    pub superseded: Vec<u32>,
    pub first_new_sequence: u32,
    pub remaining_principal: Money,
    /// earned, unpaid, after waiver
    pub carried_interest: Money,
    pub carried_penalty: Money,
    /// unearned interest of future instalments, dropped with them
    pub released_interest: Money,
    pub waived: Money,
    /// remaining principal + earned unpaid charges
    pub owed_before: Money,
    /// remaining principal + carried charges
    pub owed_after: Money,
    pub outstanding_before: Money,
    pub outstanding_after: Money,
}

impl RestructureOutcome {
    /// change the loan-outstanding account must take
    pub fn outstanding_delta(&self) -> Money {
        self.outstanding_after - self.outstanding_before
    }
}

pub struct RestructureProcessor;

impl RestructureProcessor {
    pub fn restructure(current: &InstalmentSchedule, request: &RestructureRequest) -> Result<RestructureOutcome> {
        request.terms.validate()?;
        if request.waiver.interest.is_negative() || request.waiver.penalty.is_negative() {
            return Err(LedgerError::InvalidWaiver {
                message: "waiver amounts must not be negative".to_string(),
            });
        }

        let remaining_principal = current.remaining_principal();
        if !remaining_principal.is_positive() {
            return Err(LedgerError::InvalidPrincipal {
                amount: remaining_principal,
            });
        }
        let outstanding_before = current.outstanding();

        let mut schedule = current.clone();
        let frozen = schedule.supersede_open();
        let as_of = request.as_of.date_naive();

        let mut earned_interest = Money::ZERO;
        let mut earned_penalty = Money::ZERO;
        let mut released_interest = Money::ZERO;
        for entry in &frozen {
            let interest = entry.interest_outstanding().max(Money::ZERO);
            let penalty = entry.penalty_outstanding().max(Money::ZERO);
            if entry.due_date.date_naive() <= as_of {
                earned_interest += interest;
                earned_penalty += penalty;
            } else {
                // penalties only land on overdue entries; anything left here goes with the interest
                released_interest += interest + penalty;
            }
        }

        if request.waiver.interest > earned_interest || request.waiver.penalty > earned_penalty {
            return Err(LedgerError::InvalidWaiver {
                message: format!(
                    "waiver of {} interest / {} penalty exceeds the {} / {} carried",
                    request.waiver.interest, request.waiver.penalty, earned_interest, earned_penalty
                ),
            });
        }

        let carried_interest = earned_interest - request.waiver.interest;
        let carried_penalty = earned_penalty - request.waiver.penalty;

        let first_new_sequence = schedule.last_sequence() + 1;
        let generated = ScheduleGenerator::generate(
            &ScheduleRequest::new(remaining_principal, request.terms, request.as_of).starting_at(first_new_sequence),
        )?;
        let mut entries = generated;
        if let Some(first) = entries.first_mut() {
            first.interest_due += carried_interest;
            first.penalty_due += carried_penalty;
        }
        schedule.append(entries)?;
        schedule.refresh_statuses(request.as_of);

        let owed_before = remaining_principal + earned_interest + earned_penalty;
        let owed_after = remaining_principal + carried_interest + carried_penalty;
        let waived = request.waiver.total();
        if owed_after != owed_before - waived {
            return Err(LedgerError::invariant(format!(
                "restructure owes {} after but {} before less {} waived",
                owed_after, owed_before, waived
            )));
        }

        let new_principal: Money = schedule
            .active()
            .iter()
            .filter(|e| e.sequence >= first_new_sequence)
            .map(|e| e.principal_due)
            .sum();
        if new_principal != remaining_principal {
            return Err(LedgerError::invariant(format!(
                "restructure rescheduled {} of {} principal",
                new_principal, remaining_principal
            )));
        }

        let outstanding_after = schedule.outstanding();

        Ok(RestructureOutcome {
            superseded: frozen.iter().map(|e| e.sequence).collect(),
            first_new_sequence,
            remaining_principal,
            carried_interest,
            carried_penalty,
            released_interest,
            waived,
            owed_before,
            owed_after,
            outstanding_before,
            outstanding_after,
            schedule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Rate;
    use crate::payments::AllocationEngine;
    use crate::schedule::RepaymentFrequency;
    use crate::types::{InstalmentStatus, InterestMethod};
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// 6,000 over 6 months at 12% flat: 1,000 principal + 60 interest each
    fn schedule() -> InstalmentSchedule {
        let terms = LoanTerms::new(Rate::from_percentage(12), 6, RepaymentFrequency::Monthly, InterestMethod::Flat);
        let request = ScheduleRequest::new(Money::from_major(6_000), terms, start());
        InstalmentSchedule::from_entries(ScheduleGenerator::generate(&request).unwrap())
    }

    fn new_terms() -> LoanTerms {
        LoanTerms::new(Rate::from_percentage(10), 4, RepaymentFrequency::Weekly, InterestMethod::ReducingBalance)
    }

    fn pay(schedule: &mut InstalmentSchedule, amount: i64, as_of: DateTime<Utc>) {
        let allocation = AllocationEngine::allocate(Money::from_major(amount), schedule.entries()).unwrap();
        schedule.apply_allocation(&allocation, as_of).unwrap();
    }

    #[test]
    fn test_paid_history_survives_and_numbering_continues() {
        let mut current = schedule();
        let as_of = start() + Duration::days(45);
        pay(&mut current, 1_060, as_of);
        current.refresh_statuses(as_of);

        let request = RestructureRequest {
            as_of,
            terms: new_terms(),
            waiver: Waiver::none(),
        };
        let outcome = RestructureProcessor::restructure(&current, &request).unwrap();

        assert_eq!(outcome.superseded, vec![2, 3, 4, 5, 6]);
        assert_eq!(outcome.first_new_sequence, 7);
        assert_eq!(outcome.remaining_principal, Money::from_major(5_000));
        assert_eq!(outcome.schedule.get(1).unwrap().status, InstalmentStatus::Paid);
        assert!(outcome.schedule.get(2).unwrap().is_superseded());
        assert_eq!(outcome.schedule.entries().len(), 6 + 17);
    }

    #[test]
    fn test_overdue_interest_carried_future_interest_released() {
        let current = {
            let mut s = schedule();
            // nothing paid; two instalments overdue by mid March
            s.refresh_statuses(start() + Duration::days(75));
            s
        };
        let as_of = start() + Duration::days(75);
        let request = RestructureRequest {
            as_of,
            terms: new_terms(),
            waiver: Waiver::none(),
        };
        let outcome = RestructureProcessor::restructure(&current, &request).unwrap();

        assert_eq!(outcome.carried_interest, Money::from_major(120));
        assert_eq!(outcome.released_interest, Money::from_major(240));
        assert_eq!(outcome.owed_before, Money::from_major(6_120));
        assert_eq!(outcome.owed_after, outcome.owed_before);

        let first = outcome.schedule.get(outcome.first_new_sequence).unwrap();
        assert!(first.interest_due >= Money::from_major(120));
    }

    #[test]
    fn test_owed_after_is_owed_before_less_waiver() {
        let mut current = schedule();
        let as_of = start() + Duration::days(100);
        current.refresh_statuses(as_of);
        current.get_mut(1).unwrap().penalty_due = Money::from_major(50);
        current.get_mut(1).unwrap().penalised = true;

        let request = RestructureRequest {
            as_of,
            terms: new_terms(),
            waiver: Waiver {
                interest: Money::from_major(100),
                penalty: Money::from_major(50),
            },
        };
        let outcome = RestructureProcessor::restructure(&current, &request).unwrap();

        // three instalments earned: 180 interest + 50 penalty
        assert_eq!(outcome.owed_before, Money::from_major(6_230));
        assert_eq!(outcome.waived, Money::from_major(150));
        assert_eq!(outcome.owed_after, Money::from_major(6_080));
        assert_eq!(outcome.carried_penalty, Money::ZERO);

        let principal: Money = outcome.schedule.active().iter().map(|e| e.principal_due).sum();
        assert_eq!(principal, Money::from_major(6_000));
    }

    #[test]
    fn test_waiver_cannot_exceed_carried() {
        let current = schedule();
        let request = RestructureRequest {
            as_of: start() + Duration::days(10),
            terms: new_terms(),
            waiver: Waiver {
                interest: Money::from_major(1),
                penalty: Money::ZERO,
            },
        };
        assert!(matches!(
            RestructureProcessor::restructure(&current, &request),
            Err(LedgerError::InvalidWaiver { .. })
        ));
    }

    #[test]
    fn test_outstanding_delta_matches_schedules() {
        let mut current = schedule();
        let as_of = start() + Duration::days(40);
        pay(&mut current, 500, as_of);
        current.refresh_statuses(as_of);

        let request = RestructureRequest {
            as_of,
            terms: new_terms(),
            waiver: Waiver::none(),
        };
        let outcome = RestructureProcessor::restructure(&current, &request).unwrap();
        assert_eq!(
            current.outstanding() + outcome.outstanding_delta(),
            outcome.schedule.outstanding()
        );
    }

    #[test]
    fn test_rejects_invalid_terms() {
        let current = schedule();
        let request = RestructureRequest {
            as_of: start(),
            terms: LoanTerms::new(Rate::ZERO, 6, RepaymentFrequency::Monthly, InterestMethod::Flat),
            waiver: Waiver::none(),
        };
        assert!(matches!(
            RestructureProcessor::restructure(&current, &request),
            Err(LedgerError::InvalidInterestRate { .. })
        ));
    }
}
