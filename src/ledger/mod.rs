//! Balance ledger: the only writer of member account balances.
//!
//! Every mutation happens under an exclusive per-account row lock and is
//! paired with an immutable [`LedgerEntry`], so an account's balance is a
//! cache of its entry log and can always be rebuilt by replaying it.

pub mod account;
mod lock;

use dashmap::DashMap;
use hourglass_rs::SafeTimeProvider;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::types::{AccountId, AccountKind, IdempotencyKey, MemberId};

pub use account::{ApplyOutcome, BalanceAccount, Decline, LedgerEntry, LedgerReason};

use lock::{RowGuard, RowLock};

type AccountRow = RowLock<BalanceAccount>;

/// transactional core owning all balance mutation
pub struct BalanceLedger {
    accounts: DashMap<AccountId, Arc<AccountRow>>,
    /// owner and kind never change after opening, so lookups skip the row lock
    holders: DashMap<AccountId, (MemberId, AccountKind)>,
    config: LedgerConfig,
    time: Arc<SafeTimeProvider>,
    events: Mutex<EventStore>,
}

impl BalanceLedger {
    pub fn new(config: LedgerConfig, time: Arc<SafeTimeProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            accounts: DashMap::new(),
            holders: DashMap::new(),
            config,
            time,
            events: Mutex::new(EventStore::new()),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// open a zero-balance account for a member
    pub fn open_account(&self, member_id: MemberId, kind: AccountKind) -> AccountId {
        let id = Uuid::new_v4();
        let account = BalanceAccount::open(id, member_id, kind, self.time.now());
        self.accounts.insert(id, Arc::new(RowLock::new(account)));
        self.holders.insert(id, (member_id, kind));
        debug!(account_id = %id, member_id = %member_id, ?kind, "account opened");
        id
    }

    pub fn contains(&self, account_id: AccountId) -> bool {
        self.accounts.contains_key(&account_id)
    }

    fn row(&self, account_id: AccountId) -> Result<Arc<AccountRow>> {
        // clone the Arc out so no shard lock is held while waiting on the row
        self.accounts
            .get(&account_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(LedgerError::AccountNotFound { id: account_id })
    }

    /// acquire the exclusive row lock of an account.
    ///
    /// Each attempt waits `lock_timeout_ms`; after `max_lock_attempts`
    /// failed attempts a retryable [`LedgerError::LockTimeout`] is returned.
    pub fn lock(&self, account_id: AccountId) -> Result<LockedAccount<'_>> {
        let row = self.row(account_id)?;
        let attempts = self.config.max_lock_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(guard) = row.try_lock_for(self.config.lock_timeout()) {
                return Ok(LockedAccount {
                    ledger: self,
                    account_id,
                    guard,
                });
            }
            warn!(account_id = %account_id, attempt, "row lock wait timed out");
            if attempt < attempts {
                thread::sleep(self.config.retry_backoff());
            }
        }

        Err(LedgerError::LockTimeout { account_id, attempts })
    }

    /// apply `delta` to an account as one locked, idempotent operation
    #[instrument(
        name = "ledger.apply",
        skip_all,
        fields(account_id = %account_id, delta = %delta, reason = %reason, key = %key),
        err
    )]
    pub fn apply(
        &self,
        account_id: AccountId,
        delta: Money,
        reason: LedgerReason,
        key: &IdempotencyKey,
    ) -> Result<ApplyOutcome> {
        let locked = self.lock(account_id)?;
        locked.apply(delta, reason, key)
    }

    pub fn balance(&self, account_id: AccountId) -> Result<Money> {
        Ok(self.lock(account_id)?.balance())
    }

    /// full copy of an account including its entry log
    pub fn snapshot(&self, account_id: AccountId) -> Result<BalanceAccount> {
        Ok(self.lock(account_id)?.snapshot())
    }

    pub fn entries(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        Ok(self.lock(account_id)?.guard.with(|a| a.entries().to_vec()))
    }

    /// balance rebuilt from the entry log
    pub fn replay(&self, account_id: AccountId) -> Result<Money> {
        Ok(self.lock(account_id)?.guard.with(|a| a.replay()))
    }

    /// check the cached balance against a replay of the entry log
    pub fn reconcile(&self, account_id: AccountId) -> Result<Money> {
        let locked = self.lock(account_id)?;
        let (cached, replayed, version, logged) = locked.guard.with(|a| {
            (a.current_balance, a.replay(), a.version, a.entries().len() as u64)
        });

        if cached != replayed || version != logged {
            return Err(LedgerError::invariant(format!(
                "account {} caches {} (v{}) but its log replays to {} ({} entries)",
                account_id, cached, version, replayed, logged
            )));
        }
        Ok(cached)
    }

    /// ids of every account a member holds, optionally of one kind
    pub fn accounts_of(&self, member_id: MemberId, kind: Option<AccountKind>) -> Vec<AccountId> {
        self.holders
            .iter()
            .filter(|h| {
                let (owner, held_kind) = *h.value();
                owner == member_id && kind.map_or(true, |k| held_kind == k)
            })
            .map(|h| *h.key())
            .collect()
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take_events()
    }

    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).emit(event);
    }
}

/// an account whose row lock is held; released on drop.
///
/// Composite operations (repayments, settlement confirmations) hold this
/// while they also update loan or settlement state, so nothing else can
/// touch the balance in between.
pub struct LockedAccount<'a> {
    ledger: &'a BalanceLedger,
    account_id: AccountId,
    guard: RowGuard<BalanceAccount>,
}

impl<'a> LockedAccount<'a> {
    pub fn id(&self) -> AccountId {
        self.account_id
    }

    pub fn balance(&self) -> Money {
        self.guard.with(|a| a.current_balance)
    }

    pub fn version(&self) -> u64 {
        self.guard.with(|a| a.version)
    }

    pub fn kind(&self) -> AccountKind {
        self.guard.with(|a| a.kind)
    }

    pub fn member_id(&self) -> MemberId {
        self.guard.with(|a| a.member_id)
    }

    pub fn snapshot(&self) -> BalanceAccount {
        self.guard.with(|a| a.clone())
    }

    /// entry a key produced earlier on this account
    pub fn applied_entry(&self, key: &IdempotencyKey) -> Option<LedgerEntry> {
        self.guard.with(|a| a.applied_entry(key).cloned())
    }

    /// apply a delta under the already-held lock
    pub fn apply(&self, delta: Money, reason: LedgerReason, key: &IdempotencyKey) -> Result<ApplyOutcome> {
        if delta.is_zero() {
            return Err(LedgerError::InvalidAmount { amount: delta });
        }

        let now = self.ledger.time.now();
        let outcome = self.guard.with(|a| a.apply(delta, reason, key, now));

        match &outcome {
            ApplyOutcome::Applied(entry) => {
                info!(
                    account_id = %self.account_id,
                    %delta,
                    balance_after = %entry.balance_after,
                    %reason,
                    "balance changed"
                );
                self.ledger.emit(Event::BalanceChanged {
                    account_id: self.account_id,
                    sequence: entry.sequence,
                    delta,
                    balance_after: entry.balance_after,
                    reason,
                    idempotency_key: key.clone(),
                    timestamp: now,
                });
            }
            ApplyOutcome::Replayed(entry) => {
                debug!(account_id = %self.account_id, %key, sequence = entry.sequence, "key already applied");
            }
            ApplyOutcome::Declined(decline) => {
                warn!(account_id = %self.account_id, %key, %decline, "mutation declined");
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hourglass_rs::TimeSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ledger(config: LedgerConfig) -> BalanceLedger {
        let time = Arc::new(SafeTimeProvider::new(TimeSource::Test(Utc::now())));
        BalanceLedger::new(config, time).unwrap()
    }

    #[test]
    fn test_apply_twice_with_same_key() {
        let ledger = ledger(LedgerConfig::default());
        let account = ledger.open_account(Uuid::new_v4(), AccountKind::Savings);
        let key = IdempotencyKey::new("mpesa-QJK21");

        let first = ledger.apply(account, Money::from_major(1_000), LedgerReason::Deposit, &key).unwrap();
        let second = ledger.apply(account, Money::from_major(1_000), LedgerReason::Deposit, &key).unwrap();

        assert!(first.is_applied());
        assert!(matches!(second, ApplyOutcome::Replayed(_)));
        assert_eq!(first.entry(), second.entry());
        assert_eq!(ledger.balance(account).unwrap(), Money::from_major(1_000));
        assert_eq!(ledger.entries(account).unwrap().len(), 1);
    }

    #[test]
    fn test_insufficient_funds_is_a_decline() {
        let ledger = ledger(LedgerConfig::default());
        let account = ledger.open_account(Uuid::new_v4(), AccountKind::Savings);
        ledger
            .apply(account, Money::from_major(300), LedgerReason::Deposit, &"d-1".into())
            .unwrap();

        let outcome = ledger
            .apply(account, Money::from_major(-500), LedgerReason::Withdrawal, &"w-1".into())
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Declined(Decline::InsufficientFunds {
                available: Money::from_major(300),
                requested: Money::from_major(500),
            })
        );
        assert_eq!(ledger.balance(account).unwrap(), Money::from_major(300));
    }

    #[test]
    fn test_zero_delta_and_unknown_account() {
        let ledger = ledger(LedgerConfig::default());
        let account = ledger.open_account(Uuid::new_v4(), AccountKind::Shares);

        let err = ledger
            .apply(account, Money::ZERO, LedgerReason::Deposit, &"z".into())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));

        let err = ledger
            .apply(Uuid::new_v4(), Money::ONE, LedgerReason::Deposit, &"x".into())
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound { .. }));
    }

    #[test]
    fn test_lock_timeout_is_retryable() {
        let ledger = ledger(LedgerConfig {
            lock_timeout_ms: 5,
            max_lock_attempts: 2,
            retry_backoff_ms: 1,
        });
        let account = ledger.open_account(Uuid::new_v4(), AccountKind::Deposit);

        let held = ledger.lock(account).unwrap();
        let err = ledger
            .apply(account, Money::ONE, LedgerReason::Deposit, &"d".into())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, LedgerError::LockTimeout { attempts: 2, .. }));

        drop(held);
        assert!(ledger
            .apply(account, Money::ONE, LedgerReason::Deposit, &"d".into())
            .unwrap()
            .is_applied());
    }

    #[test]
    fn test_concurrent_tellers_serialise() {
        let ledger = ledger(LedgerConfig::default());
        let account = ledger.open_account(Uuid::new_v4(), AccountKind::Savings);
        let declined = AtomicUsize::new(0);

        thread::scope(|s| {
            for teller in 0..4 {
                let ledger = &ledger;
                let declined = &declined;
                s.spawn(move || {
                    for i in 0..25 {
                        let key = IdempotencyKey::new(format!("t{}-{}", teller, i));
                        ledger
                            .apply(account, Money::from_major(100), LedgerReason::Deposit, &key)
                            .unwrap();
                        let key = key.derive("withdraw");
                        let outcome = ledger
                            .apply(account, Money::from_major(-60), LedgerReason::Withdrawal, &key)
                            .unwrap();
                        if outcome.is_declined() {
                            declined.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        // every withdrawal follows its own deposit, so none can overdraw
        assert_eq!(declined.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.balance(account).unwrap(), Money::from_major(4_000));
        assert_eq!(ledger.reconcile(account).unwrap(), Money::from_major(4_000));
        assert_eq!(ledger.entries(account).unwrap().len(), 200);
    }

    #[test]
    fn test_replay_equals_balance_and_events() {
        let ledger = ledger(LedgerConfig::default());
        let member = Uuid::new_v4();
        let savings = ledger.open_account(member, AccountKind::Savings);
        let shares = ledger.open_account(member, AccountKind::Shares);

        ledger.apply(savings, Money::from_major(2_000), LedgerReason::Deposit, &"a".into()).unwrap();
        ledger.apply(savings, Money::from_minor(-12_550), LedgerReason::Withdrawal, &"b".into()).unwrap();
        ledger.apply(shares, Money::from_major(500), LedgerReason::Deposit, &"c".into()).unwrap();

        assert_eq!(ledger.replay(savings).unwrap(), ledger.balance(savings).unwrap());
        assert_eq!(ledger.balance(savings).unwrap(), Money::from_minor(187_450));
        assert_eq!(ledger.accounts_of(member, Some(AccountKind::Shares)), vec![shares]);
        assert_eq!(ledger.accounts_of(member, None).len(), 2);

        let events = ledger.take_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::BalanceChanged { reason: LedgerReason::Deposit, .. }));
        assert!(ledger.take_events().is_empty());
    }

    #[test]
    fn test_accounts_of_lists_busy_rows() {
        let ledger = ledger(LedgerConfig {
            lock_timeout_ms: 5,
            max_lock_attempts: 1,
            retry_backoff_ms: 0,
        });
        let member = Uuid::new_v4();
        let savings = ledger.open_account(member, AccountKind::Savings);
        let deposits = ledger.open_account(member, AccountKind::Deposit);
        ledger.open_account(Uuid::new_v4(), AccountKind::Savings);

        let _held = ledger.lock(savings).unwrap();
        let mut held_by_member = ledger.accounts_of(member, None);
        held_by_member.sort();
        let mut expected = vec![savings, deposits];
        expected.sort();
        assert_eq!(held_by_member, expected);
        assert_eq!(ledger.accounts_of(member, Some(AccountKind::Savings)), vec![savings]);
    }

    #[test]
    fn test_rejects_unbounded_lock_timeout() {
        let time = Arc::new(SafeTimeProvider::new(TimeSource::Test(Utc::now())));
        let result = BalanceLedger::new(
            LedgerConfig {
                lock_timeout_ms: u64::MAX,
                ..LedgerConfig::default()
            },
            time,
        );
        assert!(matches!(result, Err(LedgerError::InvalidConfiguration { .. })));
    }
}
