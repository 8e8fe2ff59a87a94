use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};

/// subscriber phone number, 10 to 15 ascii digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = (10..=15).contains(&raw.len()) && raw.bytes().all(|b| b.is_ascii_digit());
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(LedgerError::InvalidPhoneNumber {
                phone: raw.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// the gateway refused the request; retrying will not help
    #[error("rejected: {message}")]
    Rejected { message: String },

    /// no answer in time or the gateway is down; retry with the same reference
    #[error("timeout: {message}")]
    Timeout { message: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }
}

/// a single failed gateway call, before any retries
impl From<GatewayError> for LedgerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected { message } => LedgerError::GatewayRejected { message },
            GatewayError::Timeout { message } => LedgerError::GatewayUnavailable { attempts: 1, message },
        }
    }
}

/// gateway's view of a payment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum GatewayStatus {
    Pending,
    Succeeded {
        gateway_tx_id: String,
        amount: Money,
        paid_by: String,
    },
    Failed {
        result_code: i32,
    },
}

/// push notification from the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub gateway_tx_id: String,
    pub reference: String,
    /// zero means the subscriber paid
    pub result_code: i32,
    pub amount: Money,
    pub paid_by: String,
}

impl CallbackPayload {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// mobile-money gateway client
pub trait MobileMoneyGateway: Send + Sync {
    /// ask the subscriber to pay; returns the gateway transaction id
    fn initiate(
        &self,
        phone: &PhoneNumber,
        amount: Money,
        reference: &str,
    ) -> std::result::Result<String, GatewayError>;

    fn query_status(&self, reference: &str) -> std::result::Result<GatewayStatus, GatewayError>;
}
