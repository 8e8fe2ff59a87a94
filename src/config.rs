use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::penalty::PenaltyConfig;
use crate::schedule::{LoanTerms, RepaymentFrequency};
use crate::types::{InterestMethod, ProductId};

/// longest single wait on an account row
pub const MAX_LOCK_TIMEOUT_MS: u64 = 60_000;
/// longest pause between lock or gateway attempts
pub const MAX_BACKOFF_MS: u64 = 60_000;
/// longest confirmation window a settlement may be given
pub const MAX_EXPIRY_WINDOW_SECS: i64 = 86_400;

/// row lock behaviour of the balance ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// how long one attempt waits for an account row
    pub lock_timeout_ms: u64,
    /// attempts before a lock timeout is surfaced as retryable
    pub max_lock_attempts: u32,
    /// pause between attempts
    pub retry_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            max_lock_attempts: 3,
            retry_backoff_ms: 25,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_lock_attempts == 0 {
            return Err(LedgerError::InvalidConfiguration {
                message: "max_lock_attempts must be at least 1".to_string(),
            });
        }
        if self.lock_timeout_ms == 0 || self.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("lock_timeout_ms must be between 1 and {}", MAX_LOCK_TIMEOUT_MS),
            });
        }
        if self.retry_backoff_ms > MAX_BACKOFF_MS {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("retry_backoff_ms must be at most {}", MAX_BACKOFF_MS),
            });
        }
        Ok(())
    }
}

/// mobile-money settlement behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// window after initiation in which a confirmation is accepted
    pub expiry_window_secs: i64,
    /// attempts per gateway call on timeout / unavailability
    pub gateway_max_attempts: u32,
    /// pause between gateway attempts
    pub gateway_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            expiry_window_secs: 120,
            gateway_max_attempts: 3,
            gateway_backoff_ms: 100,
        }
    }
}

impl SettlementConfig {
    pub fn expiry_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::try_seconds(self.expiry_window_secs).ok_or_else(|| LedgerError::InvalidConfiguration {
            message: format!("expiry_window_secs out of range: {}", self.expiry_window_secs),
        })
    }

    pub fn gateway_backoff(&self) -> Duration {
        Duration::from_millis(self.gateway_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiry_window_secs <= 0 || self.expiry_window_secs > MAX_EXPIRY_WINDOW_SECS {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("expiry_window_secs must be between 1 and {}", MAX_EXPIRY_WINDOW_SECS),
            });
        }
        if self.gateway_max_attempts == 0 {
            return Err(LedgerError::InvalidConfiguration {
                message: "gateway_max_attempts must be at least 1".to_string(),
            });
        }
        if self.gateway_backoff_ms > MAX_BACKOFF_MS {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("gateway_backoff_ms must be at most {}", MAX_BACKOFF_MS),
            });
        }
        Ok(())
    }
}

/// loan product rules; read-only input to the loan book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanProduct {
    pub id: ProductId,
    pub name: String,
    pub annual_rate: Rate,
    pub frequency: RepaymentFrequency,
    pub interest_method: InterestMethod,
    pub allow_multiple_loans: bool,
    pub require_good_standing: bool,
    #[serde(default)]
    pub penalty: Option<PenaltyConfig>,
    /// days the oldest overdue instalment may age before the loan defaults
    #[serde(default)]
    pub default_after_days: Option<u32>,
}

impl LoanProduct {
    pub fn new(
        name: impl Into<String>,
        annual_rate: Rate,
        frequency: RepaymentFrequency,
        interest_method: InterestMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            annual_rate,
            frequency,
            interest_method,
            allow_multiple_loans: true,
            require_good_standing: false,
            penalty: None,
            default_after_days: None,
        }
    }

    /// long-term reducing balance loan, one at a time, members in good standing only
    pub fn development_loan() -> Self {
        Self {
            allow_multiple_loans: false,
            require_good_standing: true,
            penalty: Some(
                PenaltyConfig::new(Rate::from_percentage(5))
                    .with_grace_period(7)
                    .with_minimum(Money::from_major(100)),
            ),
            default_after_days: Some(90),
            ..Self::new(
                "Development Loan",
                Rate::from_percentage(12),
                RepaymentFrequency::Monthly,
                InterestMethod::ReducingBalance,
            )
        }
    }

    /// short flat-rate loan repaid weekly, several may run side by side
    pub fn emergency_loan() -> Self {
        Self {
            allow_multiple_loans: true,
            require_good_standing: false,
            penalty: Some(PenaltyConfig::new(Rate::from_decimal(dec!(0.02))).with_grace_period(3)),
            default_after_days: Some(60),
            ..Self::new(
                "Emergency Loan",
                Rate::from_percentage(15),
                RepaymentFrequency::Weekly,
                InterestMethod::Flat,
            )
        }
    }

    pub fn with_frequency(mut self, frequency: RepaymentFrequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_rules(mut self, allow_multiple_loans: bool, require_good_standing: bool) -> Self {
        self.allow_multiple_loans = allow_multiple_loans;
        self.require_good_standing = require_good_standing;
        self
    }

    pub fn with_penalty(mut self, penalty: PenaltyConfig) -> Self {
        self.penalty = Some(penalty);
        self
    }

    pub fn with_default_after(mut self, days: u32) -> Self {
        self.default_after_days = Some(days);
        self
    }

    /// terms of a loan taken on this product
    pub fn terms(&self, term_months: u32) -> LoanTerms {
        LoanTerms::new(self.annual_rate, term_months, self.frequency, self.interest_method)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.annual_rate.is_positive() {
            return Err(LedgerError::InvalidInterestRate {
                rate: self.annual_rate,
            });
        }
        if let Some(penalty) = &self.penalty {
            penalty.validate()?;
        }
        Ok(())
    }
}

/// engine-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub settlement: SettlementConfig,
    pub products: Vec<LoanProduct>,
}

impl EngineConfig {
    /// parse and validate a json document; missing sections take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|e| LedgerError::InvalidConfiguration {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.settlement.validate()?;
        for product in &self.products {
            product.validate()?;
        }
        Ok(())
    }

    pub fn product(&self, name: &str) -> Option<&LoanProduct> {
        self.products.iter().find(|p| p.name == name)
    }
}
