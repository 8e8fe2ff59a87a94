use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{AccountId, LoanId};

use super::gateway::PhoneNumber;

/// settlement lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Initiated,
    AwaitingConfirmation,
    Confirmed,
    Failed,
    Expired,
}

impl SettlementState {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            SettlementState::Confirmed | SettlementState::Failed | SettlementState::Expired
        )
    }
}

/// which path resolved a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    /// gateway refused the payment request outright
    Initiation,
    Callback,
    Poll,
    ExpirySweep,
}

/// what a confirmed settlement does to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SettlementEffect {
    Deposit {
        account_id: AccountId,
    },
    /// any excess over the outstanding balance goes to `excess_to`
    Repayment { loan_id: LoanId, excess_to: AccountId },
}

/// a mobile-money payment awaiting the gateway's word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSettlement {
    /// external reference, also the ledger idempotency key
    pub reference: String,
    pub effect: SettlementEffect,
    pub amount: Money,
    pub phone: PhoneNumber,
    pub gateway_tx_id: Option<String>,
    pub paid_by: Option<String>,
    pub state: SettlementState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ResolutionPath>,
    /// repayment excess owed to `excess_to` once confirmed
    #[serde(default)]
    pub excess_due: Money,
    #[serde(default)]
    pub excess_credited: bool,
}

impl PendingSettlement {
    pub fn new(
        reference: String,
        effect: SettlementEffect,
        amount: Money,
        phone: PhoneNumber,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reference,
            effect,
            amount,
            phone,
            gateway_tx_id: None,
            paid_by: None,
            state: SettlementState::Initiated,
            created_at,
            expires_at,
            resolved_at: None,
            resolution: None,
            excess_due: Money::ZERO,
            excess_credited: false,
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// still waiting and inside its window
    pub fn is_confirmable(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_closed() && !self.is_past_expiry(now)
    }

    /// confirmed with excess that has not reached the member account yet
    pub fn owes_excess(&self) -> bool {
        self.state == SettlementState::Confirmed && self.excess_due.is_positive() && !self.excess_credited
    }

    /// record the gateway acknowledgement; a late ack on a later state is ignored
    pub(crate) fn acknowledge(&mut self, gateway_tx_id: &str) -> bool {
        if self.state != SettlementState::Initiated {
            return false;
        }
        self.gateway_tx_id = Some(gateway_tx_id.to_string());
        self.state = SettlementState::AwaitingConfirmation;
        true
    }

    pub(crate) fn resolve(&mut self, state: SettlementState, path: ResolutionPath, now: DateTime<Utc>) {
        self.state = state;
        self.resolution = Some(path);
        self.resolved_at = Some(now);
    }
}
