use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::InstalmentStatus;

/// one scheduled instalment of a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalmentScheduleEntry {
    pub sequence: u32,
    pub due_date: DateTime<Utc>,
    pub principal_due: Money,
    pub interest_due: Money,
    pub penalty_due: Money,
    pub principal_paid: Money,
    pub interest_paid: Money,
    pub penalty_paid: Money,
    pub status: InstalmentStatus,
    /// set once a late penalty has been charged against this entry
    #[serde(default)]
    pub penalised: bool,
}

impl InstalmentScheduleEntry {
    pub fn new(
        sequence: u32,
        due_date: DateTime<Utc>,
        principal_due: Money,
        interest_due: Money,
    ) -> Self {
        Self {
            sequence,
            due_date,
            principal_due,
            interest_due,
            penalty_due: Money::ZERO,
            principal_paid: Money::ZERO,
            interest_paid: Money::ZERO,
            penalty_paid: Money::ZERO,
            status: InstalmentStatus::Upcoming,
            penalised: false,
        }
    }

    pub fn total_due(&self) -> Money {
        self.principal_due + self.interest_due + self.penalty_due
    }

    pub fn amount_paid_to_date(&self) -> Money {
        self.principal_paid + self.interest_paid + self.penalty_paid
    }

    pub fn remaining(&self) -> Money {
        self.total_due() - self.amount_paid_to_date()
    }

    pub fn penalty_outstanding(&self) -> Money {
        self.penalty_due - self.penalty_paid
    }

    pub fn interest_outstanding(&self) -> Money {
        self.interest_due - self.interest_paid
    }

    pub fn principal_outstanding(&self) -> Money {
        self.principal_due - self.principal_paid
    }

    pub fn is_superseded(&self) -> bool {
        self.status == InstalmentStatus::Superseded
    }

    pub fn is_settled(&self) -> bool {
        !self.remaining().is_positive()
    }

    /// recompute status from payments and the reference date.
    /// superseded entries are frozen history and never change.
    pub fn refresh_status(&mut self, as_of: DateTime<Utc>) {
        if self.is_superseded() {
            return;
        }

        self.status = if self.is_settled() {
            InstalmentStatus::Paid
        } else if self.due_date.date_naive() < as_of.date_naive() {
            InstalmentStatus::Overdue
        } else if self.due_date.date_naive() == as_of.date_naive() {
            InstalmentStatus::Due
        } else if self.amount_paid_to_date().is_positive() {
            InstalmentStatus::PartiallyPaid
        } else {
            InstalmentStatus::Upcoming
        };
    }

    /// whole days past due as of the given date, zero if not yet due
    pub fn days_overdue(&self, as_of: DateTime<Utc>) -> u32 {
        let days = (as_of.date_naive() - self.due_date.date_naive()).num_days();
        u32::try_from(days.max(0)).unwrap_or(u32::MAX)
    }
}
