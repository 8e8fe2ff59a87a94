//! Mobile-money settlement.
//!
//! A payment is requested from the gateway and held as a [`PendingSettlement`]
//! until the push callback or an active poll reports the outcome. Whichever
//! path arrives first resolves it; the other finds the state already closed
//! under the same locks and does nothing. A confirmation holds the target
//! account's row lock and then the settlement lock, so it serializes with
//! teller traffic on that account.

pub mod gateway;
pub mod pending;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hourglass_rs::SafeTimeProvider;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, info, instrument, warn};

use crate::config::SettlementConfig;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::ledger::{ApplyOutcome, BalanceLedger, LedgerReason};
use crate::loan_book::LoanBook;
use crate::types::{AccountId, IdempotencyKey, LoanId, PaymentSource};

pub use gateway::{CallbackPayload, GatewayError, GatewayStatus, MobileMoneyGateway, PhoneNumber};
pub use pending::{PendingSettlement, ResolutionPath, SettlementEffect, SettlementState};

type SettlementCell = Arc<Mutex<PendingSettlement>>;

fn lock(cell: &Mutex<PendingSettlement>) -> MutexGuard<'_, PendingSettlement> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// a request to collect money from a subscriber's phone
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    pub reference: String,
    pub effect: SettlementEffect,
    pub amount: Money,
    pub phone: String,
}

impl SettlementRequest {
    pub fn deposit(reference: impl Into<String>, account_id: AccountId, amount: Money, phone: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            effect: SettlementEffect::Deposit { account_id },
            amount,
            phone: phone.into(),
        }
    }

    pub fn repayment(
        reference: impl Into<String>,
        loan_id: LoanId,
        excess_to: AccountId,
        amount: Money,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            reference: reference.into(),
            effect: SettlementEffect::Repayment { loan_id, excess_to },
            amount,
            phone: phone.into(),
        }
    }
}

/// result of one resolution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Confirmed {
        reference: String,
        amount: Money,
        /// repayment excess credited to the member account
        excess: Money,
        path: ResolutionPath,
    },
    Failed {
        reference: String,
        result_code: Option<i32>,
        path: ResolutionPath,
    },
    /// another path got there first; nothing was done
    AlreadyResolved { state: SettlementState },
    StillPending,
    Expired,
}

/// what one `poll_pending` pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub already_resolved: usize,
    /// repayment excess credits that had failed earlier and landed this pass
    pub excess_credited: usize,
    pub errors: usize,
}

/// dual-confirmation state machine between the gateway and the ledger
pub struct SettlementCoordinator<G: MobileMoneyGateway> {
    ledger: Arc<BalanceLedger>,
    loans: Arc<LoanBook>,
    gateway: Arc<G>,
    settlements: DashMap<String, SettlementCell>,
    config: SettlementConfig,
    time: Arc<SafeTimeProvider>,
    events: Mutex<EventStore>,
}

impl<G: MobileMoneyGateway> SettlementCoordinator<G> {
    pub fn new(
        loans: Arc<LoanBook>,
        gateway: Arc<G>,
        config: SettlementConfig,
        time: Arc<SafeTimeProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger: Arc::clone(loans.ledger()),
            loans,
            gateway,
            settlements: DashMap::new(),
            config,
            time,
            events: Mutex::new(EventStore::new()),
        })
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take_events()
    }

    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).emit(event);
    }

    fn cell(&self, reference: &str) -> Result<SettlementCell> {
        self.settlements
            .get(reference)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| LedgerError::SettlementNotFound {
                reference: reference.to_string(),
            })
    }

    /// snapshot of a settlement
    pub fn get(&self, reference: &str) -> Result<PendingSettlement> {
        let cell = self.cell(reference)?;
        let settlement = lock(&cell).clone();
        Ok(settlement)
    }

    fn check_target(&self, effect: &SettlementEffect) -> Result<()> {
        let account_id = match *effect {
            SettlementEffect::Deposit { account_id } => account_id,
            SettlementEffect::Repayment { loan_id, excess_to } => {
                self.loans.outstanding_account(loan_id)?;
                excess_to
            }
        };
        if self.ledger.contains(account_id) {
            Ok(())
        } else {
            Err(LedgerError::AccountNotFound { id: account_id })
        }
    }

    /// request payment from the subscriber.
    ///
    /// Idempotent per reference: an initiated settlement re-drives the
    /// gateway, one awaiting confirmation is returned as is and a closed one
    /// is refused.
    #[instrument(
        name = "settlement.initiate",
        skip_all,
        fields(reference = %request.reference, amount = %request.amount),
        err
    )]
    pub fn initiate(&self, request: SettlementRequest) -> Result<PendingSettlement> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount { amount: request.amount });
        }
        let phone = PhoneNumber::parse(&request.phone)?;
        self.check_target(&request.effect)?;

        let window = self.config.expiry_window()?;
        let now = self.time.now();
        let (cell, fresh) = match self.settlements.entry(request.reference.clone()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                let settlement = PendingSettlement::new(
                    request.reference.clone(),
                    request.effect,
                    request.amount,
                    phone.clone(),
                    now,
                    now + window,
                );
                let cell = Arc::new(Mutex::new(settlement));
                slot.insert(Arc::clone(&cell));
                (cell, true)
            }
        };

        if fresh {
            let expires_at = lock(&cell).expires_at;
            info!(%expires_at, "settlement initiated");
            self.emit(Event::SettlementInitiated {
                reference: request.reference.clone(),
                amount: request.amount,
                expires_at,
                timestamp: now,
            });
        } else {
            let mut settlement = lock(&cell);
            if settlement.amount != request.amount || settlement.effect != request.effect {
                return Err(LedgerError::AmountMismatch {
                    reference: request.reference,
                    expected: settlement.amount,
                    received: request.amount,
                });
            }
            if settlement.state.is_closed() {
                return Err(LedgerError::SettlementClosed {
                    reference: request.reference,
                    state: settlement.state,
                });
            }
            if settlement.is_past_expiry(now) {
                self.expire(&mut settlement, now);
                return Err(LedgerError::SettlementExpired {
                    reference: request.reference,
                });
            }
            if settlement.state == SettlementState::AwaitingConfirmation {
                debug!("settlement already acknowledged");
                return Ok(settlement.clone());
            }
        }

        self.drive_gateway(&cell, &phone, request.amount, &request.reference)
    }

    fn drive_gateway(
        &self,
        cell: &SettlementCell,
        phone: &PhoneNumber,
        amount: Money,
        reference: &str,
    ) -> Result<PendingSettlement> {
        match self.call_gateway("initiate", || self.gateway.initiate(phone, amount, reference)) {
            Ok(gateway_tx_id) => {
                let mut settlement = lock(cell);
                if settlement.acknowledge(&gateway_tx_id) {
                    info!(%gateway_tx_id, "gateway acknowledged");
                    self.emit(Event::SettlementAcknowledged {
                        reference: reference.to_string(),
                        gateway_tx_id,
                        timestamp: self.time.now(),
                    });
                } else {
                    debug!(state = ?settlement.state, "late acknowledgement ignored");
                }
                Ok(settlement.clone())
            }
            Err(LedgerError::GatewayRejected { message }) => {
                let mut settlement = lock(cell);
                if settlement.state == SettlementState::Initiated {
                    let now = self.time.now();
                    settlement.resolve(SettlementState::Failed, ResolutionPath::Initiation, now);
                    warn!(%message, "gateway rejected payment request");
                    self.emit(Event::SettlementFailed {
                        reference: reference.to_string(),
                        result_code: None,
                        path: ResolutionPath::Initiation,
                        timestamp: now,
                    });
                }
                Err(LedgerError::GatewayRejected { message })
            }
            Err(err) => Err(err),
        }
    }

    /// run a gateway call, retrying timeouts with the configured backoff
    fn call_gateway<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> std::result::Result<T, GatewayError>,
    ) -> Result<T> {
        let attempts = self.config.gateway_max_attempts;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err.into()),
                Err(err) => {
                    warn!(operation, attempt, error = %err, "gateway call failed");
                    last = err.to_string();
                    if attempt < attempts {
                        thread::sleep(self.config.gateway_backoff());
                    }
                }
            }
        }
        Err(LedgerError::GatewayUnavailable {
            attempts,
            message: last,
        })
    }

    /// push notification from the gateway
    #[instrument(
        name = "settlement.callback",
        skip_all,
        fields(reference = %payload.reference, result_code = payload.result_code),
        err
    )]
    pub fn handle_callback(&self, payload: CallbackPayload) -> Result<SettlementOutcome> {
        let cell = self.cell(&payload.reference)?;
        if payload.is_success() {
            self.confirm(
                &cell,
                &payload.gateway_tx_id,
                payload.amount,
                &payload.paid_by,
                ResolutionPath::Callback,
            )
        } else {
            self.fail(&cell, payload.result_code, ResolutionPath::Callback)
        }
    }

    /// ask the gateway about one settlement
    #[instrument(name = "settlement.poll", skip(self), err)]
    pub fn poll(&self, reference: &str) -> Result<SettlementOutcome> {
        let cell = self.cell(reference)?;
        {
            let mut settlement = lock(&cell);
            if settlement.state.is_closed() {
                let state = settlement.state;
                drop(settlement);
                return self.settle_excess(&cell, Ok(SettlementOutcome::AlreadyResolved { state }));
            }
            let now = self.time.now();
            if settlement.is_past_expiry(now) {
                self.expire(&mut settlement, now);
                return Ok(SettlementOutcome::Expired);
            }
        }

        match self.call_gateway("query_status", || self.gateway.query_status(reference))? {
            GatewayStatus::Pending => Ok(SettlementOutcome::StillPending),
            GatewayStatus::Succeeded {
                gateway_tx_id,
                amount,
                paid_by,
            } => self.confirm(&cell, &gateway_tx_id, amount, &paid_by, ResolutionPath::Poll),
            GatewayStatus::Failed { result_code } => self.fail(&cell, result_code, ResolutionPath::Poll),
        }
    }

    fn confirm(
        &self,
        cell: &SettlementCell,
        gateway_tx_id: &str,
        amount: Money,
        paid_by: &str,
        path: ResolutionPath,
    ) -> Result<SettlementOutcome> {
        let (reference, effect, expected) = {
            let mut settlement = lock(cell);
            let now = self.time.now();
            if !settlement.is_confirmable(now) {
                let outcome = self.unconfirmable(&mut settlement, path, now);
                drop(settlement);
                return self.settle_excess(cell, outcome);
            }
            (settlement.reference.clone(), settlement.effect, settlement.amount)
        };
        if amount != expected {
            warn!(%reference, %expected, received = %amount, "confirmation amount mismatch");
            return Err(LedgerError::AmountMismatch {
                reference,
                expected,
                received: amount,
            });
        }

        let account_id = match effect {
            SettlementEffect::Deposit { account_id } => account_id,
            SettlementEffect::Repayment { loan_id, .. } => self.loans.outstanding_account(loan_id)?,
        };
        let key = IdempotencyKey::new(reference.clone());

        let outcome = {
            let locked = self.ledger.lock(account_id)?;
            let mut settlement = lock(cell);
            let now = self.time.now();

            if !settlement.is_confirmable(now) {
                let outcome = self.unconfirmable(&mut settlement, path, now);
                drop(settlement);
                drop(locked);
                return self.settle_excess(cell, outcome);
            }

            let excess = match effect {
                SettlementEffect::Deposit { .. } => {
                    match locked.apply(amount, LedgerReason::SettlementDeposit, &key)? {
                        ApplyOutcome::Applied(_) | ApplyOutcome::Replayed(_) => Money::ZERO,
                        ApplyOutcome::Declined(decline) => {
                            return Err(LedgerError::invariant(format!("settlement deposit declined: {}", decline)))
                        }
                    }
                }
                SettlementEffect::Repayment { loan_id, .. } => {
                    let source = PaymentSource::MobileMoney {
                        reference: reference.clone(),
                    };
                    let receipt = self.loans.repay_with_lock(loan_id, &locked, amount, source, key)?;
                    receipt.unapplied_excess
                }
            };

            if settlement.gateway_tx_id.is_none() {
                settlement.gateway_tx_id = Some(gateway_tx_id.to_string());
            }
            settlement.paid_by = Some(paid_by.to_string());
            settlement.excess_due = excess;
            settlement.resolve(SettlementState::Confirmed, path, now);
            info!(%reference, %amount, ?path, "settlement confirmed");
            self.emit(Event::SettlementConfirmed {
                reference: reference.clone(),
                amount,
                path,
                timestamp: now,
            });
            SettlementOutcome::Confirmed {
                reference,
                amount,
                excess,
                path,
            }
        };

        self.settle_excess(cell, Ok(outcome))
    }

    /// finish any owed excess credit before reporting the outcome
    fn settle_excess(&self, cell: &SettlementCell, outcome: Result<SettlementOutcome>) -> Result<SettlementOutcome> {
        let outcome = outcome?;
        self.credit_excess(cell)?;
        Ok(outcome)
    }

    /// credit a confirmed repayment's excess to the member account.
    ///
    /// The apply is keyed on the settlement reference, so repeating it after a
    /// failure or from a racing path lands the money exactly once. Returns
    /// whether this call marked the credit done.
    fn credit_excess(&self, cell: &SettlementCell) -> Result<bool> {
        let (reference, excess_to, excess) = {
            let settlement = lock(cell);
            match settlement.effect {
                SettlementEffect::Repayment { excess_to, .. } if settlement.owes_excess() => {
                    (settlement.reference.clone(), excess_to, settlement.excess_due)
                }
                _ => return Ok(false),
            }
        };

        let key = IdempotencyKey::new(reference.clone()).derive("excess");
        match self.ledger.apply(excess_to, excess, LedgerReason::ExcessCredit, &key) {
            Ok(ApplyOutcome::Applied(_)) | Ok(ApplyOutcome::Replayed(_)) => {}
            Ok(ApplyOutcome::Declined(decline)) => {
                return Err(LedgerError::invariant(format!("excess credit declined: {}", decline)))
            }
            Err(err) => {
                warn!(%reference, %excess, account_id = %excess_to, error = %err, "excess credit deferred");
                return Err(err);
            }
        }

        let mut settlement = lock(cell);
        if settlement.excess_credited {
            return Ok(false);
        }
        settlement.excess_credited = true;
        info!(%reference, %excess, account_id = %excess_to, "repayment excess credited");
        Ok(true)
    }

    fn fail(&self, cell: &SettlementCell, result_code: i32, path: ResolutionPath) -> Result<SettlementOutcome> {
        let mut settlement = lock(cell);
        let now = self.time.now();
        if settlement.state.is_closed() {
            debug!(state = ?settlement.state, ?path, "failure report after resolution ignored");
            return Ok(SettlementOutcome::AlreadyResolved {
                state: settlement.state,
            });
        }
        if settlement.is_past_expiry(now) {
            self.expire(&mut settlement, now);
            return Ok(SettlementOutcome::Expired);
        }

        settlement.resolve(SettlementState::Failed, path, now);
        warn!(reference = %settlement.reference, result_code, ?path, "settlement failed");
        self.emit(Event::SettlementFailed {
            reference: settlement.reference.clone(),
            result_code: Some(result_code),
            path,
            timestamp: now,
        });
        Ok(SettlementOutcome::Failed {
            reference: settlement.reference.clone(),
            result_code: Some(result_code),
            path,
        })
    }

    /// a success report for a settlement that is closed or past its window
    fn unconfirmable(
        &self,
        settlement: &mut PendingSettlement,
        path: ResolutionPath,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<SettlementOutcome> {
        if !settlement.state.is_closed() {
            self.expire(settlement, now);
        }
        self.closed(settlement, path, now)
    }

    fn closed(
        &self,
        settlement: &PendingSettlement,
        path: ResolutionPath,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<SettlementOutcome> {
        match settlement.state {
            SettlementState::Expired => {
                self.reject_late(settlement, path, now);
                Err(LedgerError::SettlementExpired {
                    reference: settlement.reference.clone(),
                })
            }
            SettlementState::Failed => {
                self.reject_late(settlement, path, now);
                Ok(SettlementOutcome::AlreadyResolved {
                    state: settlement.state,
                })
            }
            state => {
                debug!(reference = %settlement.reference, ?state, ?path, "lost resolution race");
                Ok(SettlementOutcome::AlreadyResolved { state })
            }
        }
    }

    fn reject_late(&self, settlement: &PendingSettlement, path: ResolutionPath, now: chrono::DateTime<chrono::Utc>) {
        warn!(reference = %settlement.reference, state = ?settlement.state, ?path, "late confirmation rejected");
        self.emit(Event::LateConfirmationRejected {
            reference: settlement.reference.clone(),
            state: settlement.state,
            path,
            timestamp: now,
        });
    }

    fn expire(&self, settlement: &mut PendingSettlement, now: chrono::DateTime<chrono::Utc>) {
        settlement.resolve(SettlementState::Expired, ResolutionPath::ExpirySweep, now);
        info!(reference = %settlement.reference, "settlement expired");
        self.emit(Event::SettlementExpired {
            reference: settlement.reference.clone(),
            timestamp: now,
        });
    }

    fn open_cells(&self) -> Vec<SettlementCell> {
        let cells: Vec<SettlementCell> = self.settlements.iter().map(|s| Arc::clone(s.value())).collect();
        cells.into_iter().filter(|c| !lock(c).state.is_closed()).collect()
    }

    /// expire every open settlement past its window; returns their references
    #[instrument(name = "settlement.expire_overdue", skip(self))]
    pub fn expire_overdue(&self) -> Vec<String> {
        let now = self.time.now();
        let mut expired = Vec::new();
        for cell in self.open_cells() {
            let mut settlement = lock(&cell);
            if !settlement.state.is_closed() && settlement.is_past_expiry(now) {
                self.expire(&mut settlement, now);
                expired.push(settlement.reference.clone());
            }
        }
        expired
    }

    /// background job: sweep expired settlements, then poll the rest
    #[instrument(name = "settlement.poll_pending", skip(self))]
    pub fn poll_pending(&self) -> PollSummary {
        let mut summary = PollSummary {
            expired: self.expire_overdue().len(),
            ..PollSummary::default()
        };

        let references: Vec<String> = self
            .open_cells()
            .iter()
            .map(|c| lock(c).reference.clone())
            .collect();
        for reference in references {
            summary.polled += 1;
            match self.poll(&reference) {
                Ok(SettlementOutcome::Confirmed { .. }) => summary.confirmed += 1,
                Ok(SettlementOutcome::Failed { .. }) => summary.failed += 1,
                Ok(SettlementOutcome::Expired) => summary.expired += 1,
                Ok(SettlementOutcome::StillPending) => summary.still_pending += 1,
                Ok(SettlementOutcome::AlreadyResolved { .. }) => summary.already_resolved += 1,
                Err(err) => {
                    warn!(%reference, error = %err, "poll failed");
                    summary.errors += 1;
                }
            }
        }

        let owing: Vec<SettlementCell> = self
            .settlements
            .iter()
            .map(|s| Arc::clone(s.value()))
            .filter(|c| lock(c).owes_excess())
            .collect();
        for cell in owing {
            match self.credit_excess(&cell) {
                Ok(true) => summary.excess_credited += 1,
                Ok(false) => {}
                Err(_) => summary.errors += 1,
            }
        }

        info!(
            polled = summary.polled,
            confirmed = summary.confirmed,
            expired = summary.expired,
            excess_credited = summary.excess_credited,
            errors = summary.errors,
            "poll pass complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, LoanProduct};
    use crate::decimal::Rate;
    use crate::loan_book::{ApplicationDecision, LoanApplication};
    use crate::schedule::RepaymentFrequency;
    use crate::types::{AccountKind, InterestMethod, LoanStatus, MemberId};
    use chrono::{DateTime, Duration, Utc};
    use hourglass_rs::TimeSource;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const PHONE: &str = "254712345678";

    #[derive(Default)]
    struct FakeGateway {
        initiate_script: Mutex<VecDeque<std::result::Result<String, GatewayError>>>,
        statuses: Mutex<HashMap<String, GatewayStatus>>,
        initiate_calls: AtomicU32,
    }

    impl FakeGateway {
        fn script(&self, responses: Vec<std::result::Result<String, GatewayError>>) {
            self.initiate_script.lock().unwrap().extend(responses);
        }

        fn settle(&self, reference: &str, status: GatewayStatus) {
            self.statuses.lock().unwrap().insert(reference.to_string(), status);
        }
    }

    impl MobileMoneyGateway for FakeGateway {
        fn initiate(
            &self,
            _phone: &PhoneNumber,
            _amount: Money,
            reference: &str,
        ) -> std::result::Result<String, GatewayError> {
            self.initiate_calls.fetch_add(1, Ordering::SeqCst);
            self.initiate_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("GW-{}", reference)))
        }

        fn query_status(&self, reference: &str) -> std::result::Result<GatewayStatus, GatewayError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(reference)
                .cloned()
                .unwrap_or(GatewayStatus::Pending))
        }
    }

    fn timeout() -> std::result::Result<String, GatewayError> {
        Err(GatewayError::Timeout {
            message: "upstream timed out".to_string(),
        })
    }

    struct Fixture {
        time: Arc<SafeTimeProvider>,
        loans: Arc<LoanBook>,
        gateway: Arc<FakeGateway>,
        coordinator: SettlementCoordinator<FakeGateway>,
        member: MemberId,
        savings: AccountId,
    }

    fn fixture() -> Fixture {
        fixture_with(LedgerConfig::default())
    }

    fn fixture_with(ledger_config: LedgerConfig) -> Fixture {
        let time = Arc::new(SafeTimeProvider::new(TimeSource::Test(
            "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap(),
        )));
        let ledger = Arc::new(BalanceLedger::new(ledger_config, Arc::clone(&time)).unwrap());
        let loans = Arc::new(LoanBook::new(ledger, Arc::clone(&time)));
        let gateway = Arc::new(FakeGateway::default());
        let config = SettlementConfig {
            gateway_backoff_ms: 0,
            ..SettlementConfig::default()
        };
        let coordinator =
            SettlementCoordinator::new(Arc::clone(&loans), Arc::clone(&gateway), config, Arc::clone(&time)).unwrap();
        let member = Uuid::new_v4();
        let savings = loans.open_account(member, AccountKind::Savings);
        Fixture {
            time,
            loans,
            gateway,
            coordinator,
            member,
            savings,
        }
    }

    /// 3,000 over three months at 12% flat: 3,090 owed
    fn advance_loan(f: &Fixture) -> LoanId {
        let product = LoanProduct::new(
            "Mobile Advance",
            Rate::from_percentage(12),
            RepaymentFrequency::Monthly,
            InterestMethod::Flat,
        );
        let decision = f
            .loans
            .apply(LoanApplication::new(f.member, Money::from_major(3_000), 3), &product)
            .unwrap();
        let ApplicationDecision::Accepted(loan_id) = decision else {
            panic!("application declined");
        };
        f.loans.approve(loan_id).unwrap();
        f.loans.disburse(loan_id, f.savings).unwrap();
        loan_id
    }

    fn busy_ledger() -> LedgerConfig {
        LedgerConfig {
            lock_timeout_ms: 5,
            max_lock_attempts: 2,
            retry_backoff_ms: 1,
        }
    }

    fn success(reference: &str, amount: i64) -> CallbackPayload {
        CallbackPayload {
            gateway_tx_id: format!("GW-{}", reference),
            reference: reference.to_string(),
            result_code: 0,
            amount: Money::from_major(amount),
            paid_by: PHONE.to_string(),
        }
    }

    #[test]
    fn test_callback_confirms_deposit_once() {
        let f = fixture();
        let pending = f
            .coordinator
            .initiate(SettlementRequest::deposit("MM-1", f.savings, Money::from_major(500), PHONE))
            .unwrap();
        assert_eq!(pending.state, SettlementState::AwaitingConfirmation);
        assert_eq!(pending.gateway_tx_id.as_deref(), Some("GW-MM-1"));

        let outcome = f.coordinator.handle_callback(success("MM-1", 500)).unwrap();
        assert!(matches!(outcome, SettlementOutcome::Confirmed { excess, .. } if excess.is_zero()));

        let again = f.coordinator.handle_callback(success("MM-1", 500)).unwrap();
        assert_eq!(
            again,
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Confirmed
            }
        );
        // a garbled duplicate is still just a duplicate
        assert_eq!(
            f.coordinator.handle_callback(success("MM-1", 5)).unwrap(),
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Confirmed
            }
        );
        assert_eq!(
            f.coordinator.poll("MM-1").unwrap(),
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Confirmed
            }
        );

        let ledger = f.loans.ledger();
        assert_eq!(ledger.balance(f.savings).unwrap(), Money::from_major(500));
        assert_eq!(ledger.entries(f.savings).unwrap().len(), 1);
        assert_eq!(
            f.coordinator.get("MM-1").unwrap().resolution,
            Some(ResolutionPath::Callback)
        );
    }

    #[test]
    fn test_confirmation_before_acknowledgement() {
        let f = fixture();
        f.gateway.script(vec![timeout(), timeout(), timeout()]);

        let err = f
            .coordinator
            .initiate(SettlementRequest::deposit("MM-2", f.savings, Money::from_major(250), PHONE))
            .unwrap_err();
        assert!(matches!(err, LedgerError::GatewayUnavailable { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(f.gateway.initiate_calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.coordinator.get("MM-2").unwrap().state, SettlementState::Initiated);

        f.coordinator.handle_callback(success("MM-2", 250)).unwrap();
        let settlement = f.coordinator.get("MM-2").unwrap();
        assert_eq!(settlement.state, SettlementState::Confirmed);
        assert_eq!(settlement.gateway_tx_id.as_deref(), Some("GW-MM-2"));

        assert!(matches!(
            f.coordinator
                .initiate(SettlementRequest::deposit("MM-2", f.savings, Money::from_major(250), PHONE)),
            Err(LedgerError::SettlementClosed {
                state: SettlementState::Confirmed,
                ..
            })
        ));
    }

    #[test]
    fn test_gateway_timeout_then_success_is_retried() {
        let f = fixture();
        f.gateway.script(vec![timeout(), Ok("GW-77".to_string())]);

        let pending = f
            .coordinator
            .initiate(SettlementRequest::deposit("MM-3", f.savings, Money::from_major(100), PHONE))
            .unwrap();
        assert_eq!(pending.gateway_tx_id.as_deref(), Some("GW-77"));
        assert_eq!(f.gateway.initiate_calls.load(Ordering::SeqCst), 2);

        // same reference again: already acknowledged, gateway not called
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-3", f.savings, Money::from_major(100), PHONE))
            .unwrap();
        assert_eq!(f.gateway.initiate_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_late_callback_after_expiry_is_rejected() {
        let f = fixture();
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-4", f.savings, Money::from_major(300), PHONE))
            .unwrap();

        f.time.test_control().unwrap().advance(Duration::seconds(121));
        assert!(matches!(
            f.coordinator.handle_callback(success("MM-4", 300)),
            Err(LedgerError::SettlementExpired { .. })
        ));
        assert_eq!(f.coordinator.get("MM-4").unwrap().state, SettlementState::Expired);
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::ZERO);

        let events = f.coordinator.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::LateConfirmationRejected { state: SettlementState::Expired, .. })));

        // and again once already expired, whatever amount it claims
        assert!(matches!(
            f.coordinator.handle_callback(success("MM-4", 300)),
            Err(LedgerError::SettlementExpired { .. })
        ));
        assert!(matches!(
            f.coordinator.handle_callback(success("MM-4", 30)),
            Err(LedgerError::SettlementExpired { .. })
        ));
    }

    #[test]
    fn test_amount_mismatch_leaves_settlement_open() {
        let f = fixture();
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-5", f.savings, Money::from_major(400), PHONE))
            .unwrap();

        assert!(matches!(
            f.coordinator.handle_callback(success("MM-5", 40)),
            Err(LedgerError::AmountMismatch { .. })
        ));
        assert_eq!(
            f.coordinator.get("MM-5").unwrap().state,
            SettlementState::AwaitingConfirmation
        );
        assert!(f.loans.ledger().entries(f.savings).unwrap().is_empty());
    }

    #[test]
    fn test_rejected_request_and_failed_callback() {
        let f = fixture();
        f.gateway.script(vec![Err(GatewayError::Rejected {
            message: "subscriber barred".to_string(),
        })]);
        assert!(matches!(
            f.coordinator
                .initiate(SettlementRequest::deposit("MM-6", f.savings, Money::from_major(100), PHONE)),
            Err(LedgerError::GatewayRejected { .. })
        ));
        assert_eq!(f.coordinator.get("MM-6").unwrap().state, SettlementState::Failed);

        f.coordinator
            .initiate(SettlementRequest::deposit("MM-7", f.savings, Money::from_major(100), PHONE))
            .unwrap();
        let mut cancelled = success("MM-7", 100);
        cancelled.result_code = 1032;
        assert!(matches!(
            f.coordinator.handle_callback(cancelled).unwrap(),
            SettlementOutcome::Failed {
                result_code: Some(1032),
                ..
            }
        ));
        assert_eq!(
            f.coordinator.handle_callback(success("MM-7", 100)).unwrap(),
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Failed
            }
        );
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_invalid_requests_store_nothing() {
        let f = fixture();
        assert!(matches!(
            f.coordinator
                .initiate(SettlementRequest::deposit("MM-8", f.savings, Money::from_major(100), "07123")),
            Err(LedgerError::InvalidPhoneNumber { .. })
        ));
        assert!(matches!(
            f.coordinator
                .initiate(SettlementRequest::deposit("MM-8", Uuid::new_v4(), Money::from_major(100), PHONE)),
            Err(LedgerError::AccountNotFound { .. })
        ));
        assert!(matches!(
            f.coordinator
                .initiate(SettlementRequest::deposit("MM-8", f.savings, Money::ZERO, PHONE)),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(f.coordinator.get("MM-8"), Err(LedgerError::SettlementNotFound { .. })));
        assert_eq!(f.gateway.initiate_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbounded_expiry_window_is_refused() {
        let f = fixture();
        let config = SettlementConfig {
            expiry_window_secs: i64::MAX,
            ..SettlementConfig::default()
        };
        assert!(matches!(
            SettlementCoordinator::new(Arc::clone(&f.loans), Arc::clone(&f.gateway), config, Arc::clone(&f.time)),
            Err(LedgerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_repayment_by_poll_routes_excess() {
        let f = fixture();
        let loan_id = advance_loan(&f);

        f.coordinator
            .initiate(SettlementRequest::repayment(
                "MM-9",
                loan_id,
                f.savings,
                Money::from_major(3_200),
                PHONE,
            ))
            .unwrap();
        assert_eq!(f.coordinator.poll("MM-9").unwrap(), SettlementOutcome::StillPending);

        f.gateway.settle(
            "MM-9",
            GatewayStatus::Succeeded {
                gateway_tx_id: "GW-MM-9".to_string(),
                amount: Money::from_major(3_200),
                paid_by: PHONE.to_string(),
            },
        );
        let outcome = f.coordinator.poll("MM-9").unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Confirmed { excess, path: ResolutionPath::Poll, .. } if excess == Money::from_major(110)
        ));

        assert_eq!(f.loans.status(loan_id).unwrap(), LoanStatus::Paid);
        assert_eq!(f.loans.verify(loan_id).unwrap(), Money::ZERO);
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::from_major(3_110));
    }

    #[test]
    fn test_poll_pending_sweeps_and_resolves() {
        let f = fixture();
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-10", f.savings, Money::from_major(50), PHONE))
            .unwrap();
        f.time.test_control().unwrap().advance(Duration::seconds(90));
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-11", f.savings, Money::from_major(70), PHONE))
            .unwrap();
        f.coordinator
            .initiate(SettlementRequest::deposit("MM-12", f.savings, Money::from_major(90), PHONE))
            .unwrap();
        f.gateway.settle(
            "MM-11",
            GatewayStatus::Succeeded {
                gateway_tx_id: "GW-MM-11".to_string(),
                amount: Money::from_major(70),
                paid_by: PHONE.to_string(),
            },
        );
        f.time.test_control().unwrap().advance(Duration::seconds(60));

        let summary = f.coordinator.poll_pending();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.still_pending, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(f.coordinator.get("MM-10").unwrap().state, SettlementState::Expired);
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::from_major(70));
    }

    #[test]
    fn test_excess_credit_retried_by_duplicate_callback() {
        let f = fixture_with(busy_ledger());
        let loan_id = advance_loan(&f);
        f.coordinator
            .initiate(SettlementRequest::repayment(
                "MM-13",
                loan_id,
                f.savings,
                Money::from_major(3_200),
                PHONE,
            ))
            .unwrap();

        // a teller holds the member account while the payment lands
        let held = f.loans.ledger().lock(f.savings).unwrap();
        let err = f.coordinator.handle_callback(success("MM-13", 3_200)).unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));
        assert!(err.is_retryable());

        let settlement = f.coordinator.get("MM-13").unwrap();
        assert_eq!(settlement.state, SettlementState::Confirmed);
        assert_eq!(settlement.excess_due, Money::from_major(110));
        assert!(settlement.owes_excess());
        assert_eq!(f.loans.status(loan_id).unwrap(), LoanStatus::Paid);
        drop(held);

        assert_eq!(
            f.coordinator.handle_callback(success("MM-13", 3_200)).unwrap(),
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Confirmed
            }
        );
        assert!(f.coordinator.get("MM-13").unwrap().excess_credited);
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::from_major(3_110));

        // nothing further to credit
        assert_eq!(
            f.coordinator.poll("MM-13").unwrap(),
            SettlementOutcome::AlreadyResolved {
                state: SettlementState::Confirmed
            }
        );
        let reasons: Vec<LedgerReason> = f
            .loans
            .ledger()
            .entries(f.savings)
            .unwrap()
            .iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, vec![LedgerReason::Disbursement, LedgerReason::ExcessCredit]);
    }

    #[test]
    fn test_poll_pending_finishes_deferred_excess() {
        let f = fixture_with(busy_ledger());
        let loan_id = advance_loan(&f);
        f.coordinator
            .initiate(SettlementRequest::repayment(
                "MM-14",
                loan_id,
                f.savings,
                Money::from_major(3_150),
                PHONE,
            ))
            .unwrap();
        f.gateway.settle(
            "MM-14",
            GatewayStatus::Succeeded {
                gateway_tx_id: "GW-MM-14".to_string(),
                amount: Money::from_major(3_150),
                paid_by: PHONE.to_string(),
            },
        );

        let held = f.loans.ledger().lock(f.savings).unwrap();
        assert!(f.coordinator.poll("MM-14").unwrap_err().is_retryable());
        let summary = f.coordinator.poll_pending();
        assert_eq!(summary.polled, 0);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.excess_credited, 0);
        drop(held);

        let summary = f.coordinator.poll_pending();
        assert_eq!(summary.excess_credited, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(f.loans.ledger().balance(f.savings).unwrap(), Money::from_major(3_060));

        let summary = f.coordinator.poll_pending();
        assert_eq!(summary, PollSummary::default());
        assert_eq!(f.loans.verify(loan_id).unwrap(), Money::ZERO);
    }
}
