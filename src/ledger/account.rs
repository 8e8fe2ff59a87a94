use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::decimal::Money;
use crate::types::{AccountId, AccountKind, IdempotencyKey, MemberId};

/// why a balance moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Deposit,
    Withdrawal,
    Disbursement,
    Repayment,
    Penalty,
    Restructure,
    SettlementDeposit,
    ExcessCredit,
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerReason::Deposit => "deposit",
            LedgerReason::Withdrawal => "withdrawal",
            LedgerReason::Disbursement => "disbursement",
            LedgerReason::Repayment => "repayment",
            LedgerReason::Penalty => "penalty",
            LedgerReason::Restructure => "restructure",
            LedgerReason::SettlementDeposit => "settlement_deposit",
            LedgerReason::ExcessCredit => "excess_credit",
        };
        f.write_str(name)
    }
}

/// immutable record of one balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// 1-based position in the account's log
    pub sequence: u64,
    pub account_id: AccountId,
    pub delta: Money,
    pub balance_after: Money,
    pub reason: LedgerReason,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: DateTime<Utc>,
}

/// business decline of a ledger mutation; not an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decline {
    InsufficientFunds { available: Money, requested: Money },
}

impl fmt::Display for Decline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decline::InsufficientFunds { available, requested } => {
                write!(f, "insufficient funds: available {}, requested {}", available, requested)
            }
        }
    }
}

/// result of `BalanceLedger::apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// the delta was applied and recorded
    Applied(LedgerEntry),
    /// the key had already been applied; this is the entry it produced
    Replayed(LedgerEntry),
    /// refused without side effects; may be retried with the same key
    Declined(Decline),
}

impl ApplyOutcome {
    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            ApplyOutcome::Applied(entry) | ApplyOutcome::Replayed(entry) => Some(entry),
            ApplyOutcome::Declined(_) => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, ApplyOutcome::Declined(_))
    }
}

/// member balance account; mutated only through the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredAccount")]
pub struct BalanceAccount {
    pub id: AccountId,
    pub member_id: MemberId,
    pub kind: AccountKind,
    pub current_balance: Money,
    /// incremented on every mutation
    pub version: u64,
    pub opened_at: DateTime<Utc>,
    entries: Vec<LedgerEntry>,
    #[serde(skip)]
    applied: HashMap<IdempotencyKey, u64>,
}

/// serialized form; the idempotency memo is rebuilt from the entry log
#[derive(Deserialize)]
struct StoredAccount {
    id: AccountId,
    member_id: MemberId,
    kind: AccountKind,
    current_balance: Money,
    version: u64,
    opened_at: DateTime<Utc>,
    entries: Vec<LedgerEntry>,
}

impl From<StoredAccount> for BalanceAccount {
    fn from(stored: StoredAccount) -> Self {
        let applied = stored
            .entries
            .iter()
            .map(|e| (e.idempotency_key.clone(), e.sequence))
            .collect();
        Self {
            id: stored.id,
            member_id: stored.member_id,
            kind: stored.kind,
            current_balance: stored.current_balance,
            version: stored.version,
            opened_at: stored.opened_at,
            entries: stored.entries,
            applied,
        }
    }
}

impl BalanceAccount {
    pub(crate) fn open(id: AccountId, member_id: MemberId, kind: AccountKind, opened_at: DateTime<Utc>) -> Self {
        Self {
            id,
            member_id,
            kind,
            current_balance: Money::ZERO,
            version: 0,
            opened_at,
            entries: Vec::new(),
            applied: HashMap::new(),
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// entry previously produced by this key, if any
    pub fn applied_entry(&self, key: &IdempotencyKey) -> Option<&LedgerEntry> {
        let sequence = *self.applied.get(key)?;
        self.entries.get(usize::try_from(sequence).ok()?.checked_sub(1)?)
    }

    /// balance rebuilt from the entry log alone
    pub fn replay(&self) -> Money {
        self.entries.iter().map(|e| e.delta).sum()
    }

    /// idempotent, declining read-modify-write; caller holds the row lock
    pub(crate) fn apply(
        &mut self,
        delta: Money,
        reason: LedgerReason,
        key: &IdempotencyKey,
        timestamp: DateTime<Utc>,
    ) -> ApplyOutcome {
        if let Some(prior) = self.applied_entry(key) {
            return ApplyOutcome::Replayed(prior.clone());
        }

        let balance_after = self.current_balance + delta;
        if delta.is_negative() && balance_after.is_negative() {
            return ApplyOutcome::Declined(Decline::InsufficientFunds {
                available: self.current_balance,
                requested: delta.abs(),
            });
        }

        let entry = LedgerEntry {
            sequence: self.entries.len() as u64 + 1,
            account_id: self.id,
            delta,
            balance_after,
            reason,
            idempotency_key: key.clone(),
            timestamp,
        };

        self.current_balance = balance_after;
        self.version += 1;
        self.applied.insert(key.clone(), entry.sequence);
        self.entries.push(entry.clone());
        ApplyOutcome::Applied(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn account() -> BalanceAccount {
        BalanceAccount::open(Uuid::new_v4(), Uuid::new_v4(), AccountKind::Savings, Utc::now())
    }

    #[test]
    fn test_apply_and_replay() {
        let mut acc = account();
        let now = Utc::now();

        let first = acc.apply(Money::from_major(500), LedgerReason::Deposit, &"d-1".into(), now);
        assert!(first.is_applied());
        acc.apply(Money::from_major(-200), LedgerReason::Withdrawal, &"w-1".into(), now);

        assert_eq!(acc.current_balance, Money::from_major(300));
        assert_eq!(acc.version, 2);
        assert_eq!(acc.replay(), acc.current_balance);
        assert_eq!(acc.entries()[1].balance_after, Money::from_major(300));
    }

    #[test]
    fn test_same_key_replays() {
        let mut acc = account();
        let now = Utc::now();
        let key: IdempotencyKey = "d-1".into();

        let first = acc.apply(Money::from_major(500), LedgerReason::Deposit, &key, now);
        let second = acc.apply(Money::from_major(500), LedgerReason::Deposit, &key, now);

        assert_eq!(second, ApplyOutcome::Replayed(first.entry().unwrap().clone()));
        assert_eq!(acc.current_balance, Money::from_major(500));
        assert_eq!(acc.entries().len(), 1);
    }

    #[test]
    fn test_decline_is_not_memoised() {
        let mut acc = account();
        let now = Utc::now();
        let key: IdempotencyKey = "w-1".into();

        let declined = acc.apply(Money::from_major(-100), LedgerReason::Withdrawal, &key, now);
        assert!(declined.is_declined());
        assert_eq!(acc.version, 0);

        acc.apply(Money::from_major(150), LedgerReason::Deposit, &"d-1".into(), now);
        let retried = acc.apply(Money::from_major(-100), LedgerReason::Withdrawal, &key, now);
        assert!(retried.is_applied());
        assert_eq!(acc.current_balance, Money::from_major(50));
    }

    #[test]
    fn test_restored_account_still_replays_keys() {
        let mut acc = account();
        let now = Utc::now();
        acc.apply(Money::from_major(500), LedgerReason::Deposit, &"d-1".into(), now);
        acc.apply(Money::from_major(-120), LedgerReason::Withdrawal, &"w-1".into(), now);

        let json = serde_json::to_string(&acc).unwrap();
        let mut restored: BalanceAccount = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, acc);

        let again = restored.apply(Money::from_major(500), LedgerReason::Deposit, &"d-1".into(), now);
        assert_eq!(again, ApplyOutcome::Replayed(acc.entries()[0].clone()));
        assert_eq!(restored.current_balance, Money::from_major(380));
        assert_eq!(restored.entries().len(), 2);
    }
}
