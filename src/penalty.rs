use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::schedule::InstalmentScheduleEntry;
use crate::types::InstalmentStatus;

/// late penalty configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// one-time charge as a fraction of the unpaid instalment (0.05 = 5%)
    pub rate: Rate,
    /// days past due before a penalty applies
    #[serde(default)]
    pub grace_period_days: u32,
    /// floor for any charged penalty
    #[serde(default)]
    pub minimum_penalty: Money,
}

impl PenaltyConfig {
    pub fn new(rate: Rate) -> Self {
        Self {
            rate,
            grace_period_days: 0,
            minimum_penalty: Money::ZERO,
        }
    }

    pub fn with_grace_period(mut self, days: u32) -> Self {
        self.grace_period_days = days;
        self
    }

    pub fn with_minimum(mut self, minimum: Money) -> Self {
        self.minimum_penalty = minimum;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate.as_decimal().is_sign_negative() {
            return Err(LedgerError::InvalidInterestRate { rate: self.rate });
        }
        if self.minimum_penalty.is_negative() {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("negative minimum penalty {}", self.minimum_penalty),
            });
        }
        Ok(())
    }
}

/// engine for calculating late penalties on overdue instalments
pub struct PenaltyEngine<'a> {
    pub config: &'a PenaltyConfig,
}

impl<'a> PenaltyEngine<'a> {
    pub fn new(config: &'a PenaltyConfig) -> Self {
        Self { config }
    }

    /// penalty owed on `entry` as of the given date.
    ///
    /// Only overdue entries that have not been penalised before and whose
    /// lateness exceeds the grace period are charged.
    pub fn calculate_penalty(&self, entry: &InstalmentScheduleEntry, as_of: DateTime<Utc>) -> PenaltyCalculation {
        let days_overdue = entry.days_overdue(as_of);
        let overdue_base = entry.principal_outstanding() + entry.interest_outstanding();

        let chargeable = entry.status == InstalmentStatus::Overdue
            && !entry.penalised
            && days_overdue > self.config.grace_period_days
            && overdue_base.is_positive();

        if !chargeable {
            return PenaltyCalculation {
                sequence: entry.sequence,
                penalty_amount: Money::ZERO,
                days_overdue,
                overdue_base,
                grace_applied: days_overdue <= self.config.grace_period_days,
            };
        }

        PenaltyCalculation {
            sequence: entry.sequence,
            penalty_amount: overdue_base.apply_rate(self.config.rate).max(self.config.minimum_penalty),
            days_overdue,
            overdue_base,
            grace_applied: false,
        }
    }

    /// penalties for every chargeable entry of a schedule
    pub fn assess<'e>(
        &self,
        entries: impl IntoIterator<Item = &'e InstalmentScheduleEntry>,
        as_of: DateTime<Utc>,
    ) -> Vec<PenaltyCalculation> {
        entries
            .into_iter()
            .map(|e| self.calculate_penalty(e, as_of))
            .filter(|c| c.is_charged())
            .collect()
    }
}

/// penalty calculation result
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyCalculation {
    pub sequence: u32,
    pub penalty_amount: Money,
    pub days_overdue: u32,
    pub overdue_base: Money,
    pub grace_applied: bool,
}

impl PenaltyCalculation {
    pub fn is_charged(&self) -> bool {
        self.penalty_amount.is_positive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn overdue_entry(days: i64) -> (InstalmentScheduleEntry, DateTime<Utc>) {
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut entry = InstalmentScheduleEntry::new(2, due, Money::from_major(1_000), Money::from_major(200));
        let as_of = due + Duration::days(days);
        entry.refresh_status(as_of);
        (entry, as_of)
    }

    #[test]
    fn test_penalty_after_grace() {
        let config = PenaltyConfig::new(Rate::from_percentage(5)).with_grace_period(7);
        let engine = PenaltyEngine::new(&config);

        let (entry, as_of) = overdue_entry(5);
        let calc = engine.calculate_penalty(&entry, as_of);
        assert!(calc.grace_applied);
        assert!(!calc.is_charged());

        let (entry, as_of) = overdue_entry(10);
        let calc = engine.calculate_penalty(&entry, as_of);
        // 5% of 1,200 unpaid
        assert_eq!(calc.penalty_amount, Money::from_major(60));
        assert_eq!(calc.days_overdue, 10);
    }

    #[test]
    fn test_minimum_penalty() {
        let config = PenaltyConfig::new(Rate::from_bps(10)).with_minimum(Money::from_major(100));
        let engine = PenaltyEngine::new(&config);

        let (entry, as_of) = overdue_entry(3);
        assert_eq!(engine.calculate_penalty(&entry, as_of).penalty_amount, Money::from_major(100));
    }

    #[test]
    fn test_penalised_once() {
        let config = PenaltyConfig::new(Rate::from_percentage(5));
        let engine = PenaltyEngine::new(&config);

        let (mut entry, as_of) = overdue_entry(30);
        entry.penalised = true;
        assert!(engine.assess([&entry], as_of).is_empty());
    }

    #[test]
    fn test_not_yet_due_is_never_charged() {
        let config = PenaltyConfig::new(Rate::from_percentage(5));
        let engine = PenaltyEngine::new(&config);

        let (entry, _) = overdue_entry(0);
        let before = entry.due_date - Duration::days(1);
        let mut upcoming = entry.clone();
        upcoming.refresh_status(before);
        assert!(!engine.calculate_penalty(&upcoming, before).is_charged());
    }
}
