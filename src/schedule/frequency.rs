use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{LedgerError, Result};

/// repayment frequency of a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepaymentFrequency {
    Monthly,
    Biweekly,
    Weekly,
    Daily,
}

impl RepaymentFrequency {
    pub const ALL: [RepaymentFrequency; 4] = [
        RepaymentFrequency::Monthly,
        RepaymentFrequency::Biweekly,
        RepaymentFrequency::Weekly,
        RepaymentFrequency::Daily,
    ];

    /// instalments per year
    pub fn periods_per_year(&self) -> u32 {
        match self {
            RepaymentFrequency::Monthly => 12,
            RepaymentFrequency::Biweekly => 26,
            RepaymentFrequency::Weekly => 52,
            RepaymentFrequency::Daily => 365,
        }
    }

    /// instalments per month (26/12 for biweekly, etc)
    pub fn periods_per_month(&self) -> Decimal {
        Decimal::from(self.periods_per_year()) / Decimal::from(12)
    }

    /// due date of the `n`th instalment counted from `start`
    pub fn due_date(&self, start: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        match self {
            // chrono clamps to the last day of shorter months
            RepaymentFrequency::Monthly => start
                .checked_add_months(Months::new(n))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            RepaymentFrequency::Biweekly => start + Duration::days(14 * n as i64),
            RepaymentFrequency::Weekly => start + Duration::days(7 * n as i64),
            RepaymentFrequency::Daily => start + Duration::days(n as i64),
        }
    }
}

impl fmt::Display for RepaymentFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepaymentFrequency::Monthly => "monthly",
            RepaymentFrequency::Biweekly => "biweekly",
            RepaymentFrequency::Weekly => "weekly",
            RepaymentFrequency::Daily => "daily",
        };
        f.write_str(name)
    }
}

impl FromStr for RepaymentFrequency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(RepaymentFrequency::Monthly),
            "biweekly" => Ok(RepaymentFrequency::Biweekly),
            "weekly" => Ok(RepaymentFrequency::Weekly),
            "daily" => Ok(RepaymentFrequency::Daily),
            other => Err(LedgerError::InvalidConfiguration {
                message: format!("unsupported repayment frequency: {}", other),
            }),
        }
    }
}

/// number of instalments for a term expressed in months.
///
/// `term_months` is always a month count regardless of frequency. The result
/// is `term_months * periods_per_month` rounded to the nearest whole
/// instalment, with ties rounding up because a partial final period still
/// has to be serviced. Computed in integer arithmetic so 26/12 and 52/12 are
/// exact. Every caller that needs a period count goes through here.
pub fn instalment_count(term_months: u32, frequency: RepaymentFrequency) -> u32 {
    let periods = u64::from(term_months) * u64::from(frequency.periods_per_year());
    let whole = periods / 12;
    let remainder = periods % 12;
    let count = if remainder * 2 >= 12 { whole + 1 } else { whole };
    u32::try_from(count).unwrap_or(u32::MAX)
}
