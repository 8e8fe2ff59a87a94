/// mobile money - a settlement confirmed by callback while a poll races it
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Duration, TimeZone, Utc};
use sacco_ledger::{
    AccountKind, BalanceLedger, CallbackPayload, GatewayError, GatewayStatus, LedgerConfig, LoanBook,
    MobileMoneyGateway, Money, PhoneNumber, SafeTimeProvider, SettlementConfig, SettlementCoordinator,
    SettlementRequest, TimeSource, Uuid,
};
use tracing_subscriber::EnvFilter;

/// in-memory gateway standing in for the mobile-money provider
#[derive(Default)]
struct SandboxGateway {
    paid: Mutex<Vec<(String, Money)>>,
}

impl MobileMoneyGateway for SandboxGateway {
    fn initiate(&self, phone: &PhoneNumber, amount: Money, reference: &str) -> Result<String, GatewayError> {
        println!("gateway: push prompt to {} for KES {} ({})", phone, amount, reference);
        Ok(format!("SBX{}", reference))
    }

    fn query_status(&self, reference: &str) -> Result<GatewayStatus, GatewayError> {
        let paid = self.paid.lock().map_err(|_| GatewayError::Timeout {
            message: "sandbox poisoned".to_string(),
        })?;
        Ok(match paid.iter().find(|(r, _)| r == reference) {
            Some((_, amount)) => GatewayStatus::Succeeded {
                gateway_tx_id: format!("SBX{}", reference),
                amount: *amount,
                paid_by: "254711000222".to_string(),
            },
            None => GatewayStatus::Pending,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let time = Arc::new(SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
    )));
    let controller = time.test_control().unwrap();
    let ledger = Arc::new(BalanceLedger::new(LedgerConfig::default(), Arc::clone(&time))?);
    let loans = Arc::new(LoanBook::new(Arc::clone(&ledger), Arc::clone(&time)));
    let gateway = Arc::new(SandboxGateway::default());
    let coordinator = SettlementCoordinator::new(
        Arc::clone(&loans),
        Arc::clone(&gateway),
        SettlementConfig::default(),
        Arc::clone(&time),
    )?;

    let member = Uuid::new_v4();
    let deposits = loans.open_account(member, AccountKind::Deposit);

    let pending = coordinator.initiate(SettlementRequest::deposit(
        "MM-24060301",
        deposits,
        Money::from_major(1_500),
        "254711000222",
    ))?;
    println!("settlement {} is {:?}", pending.reference, pending.state);

    // the subscriber pays; callback and poll arrive together
    gateway
        .paid
        .lock()
        .map_err(|_| "sandbox poisoned")?
        .push(("MM-24060301".to_string(), Money::from_major(1_500)));
    let (by_callback, by_poll) = thread::scope(|s| {
        let callback = s.spawn(|| {
            coordinator.handle_callback(CallbackPayload {
                gateway_tx_id: "SBXMM-24060301".to_string(),
                reference: "MM-24060301".to_string(),
                result_code: 0,
                amount: Money::from_major(1_500),
                paid_by: "254711000222".to_string(),
            })
        });
        let poll = s.spawn(|| coordinator.poll("MM-24060301"));
        (callback.join(), poll.join())
    });
    println!("callback: {:?}", by_callback.map_err(|_| "callback thread panicked")??);
    println!("poll:     {:?}", by_poll.map_err(|_| "poll thread panicked")??);
    println!("deposit balance: KES {}", ledger.balance(deposits)?);

    // a second prompt the subscriber ignores
    coordinator.initiate(SettlementRequest::deposit(
        "MM-24060302",
        deposits,
        Money::from_major(800),
        "254711000222",
    ))?;
    controller.advance(Duration::minutes(5));
    let summary = coordinator.poll_pending();
    println!("sweep: {:?}", summary);
    println!("MM-24060302 is {:?}", coordinator.get("MM-24060302")?.state);

    for event in coordinator.take_events() {
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(())
}
