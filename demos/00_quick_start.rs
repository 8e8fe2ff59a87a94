/// quick start - apply, disburse and repay a development loan
use std::sync::Arc;

use sacco_ledger::{
    AccountKind, ApplicationDecision, BalanceLedger, LedgerConfig, LoanApplication, LoanBook, LoanProduct, Money,
    PaymentSource, SafeTimeProvider, TimeSource, Uuid,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let time = Arc::new(SafeTimeProvider::new(TimeSource::System));
    let ledger = Arc::new(BalanceLedger::new(LedgerConfig::default(), Arc::clone(&time))?);
    let loans = LoanBook::new(Arc::clone(&ledger), time);

    // a member with a savings account
    let member = Uuid::new_v4();
    let savings = loans.open_account(member, AccountKind::Savings);

    // KES 60,000 over 12 months
    let product = LoanProduct::development_loan();
    let decision = loans.apply(LoanApplication::new(member, Money::from_major(60_000), 12), &product)?;
    let loan_id = match decision {
        ApplicationDecision::Accepted(id) => id,
        ApplicationDecision::Declined(reasons) => {
            for reason in reasons {
                println!("declined: {}", reason);
            }
            return Ok(());
        }
    };

    loans.approve(loan_id)?;
    let outstanding = loans.disburse(loan_id, savings)?;
    println!("disbursed, outstanding: KES {}", outstanding);

    // pay the first instalment in cash
    let first = loans.schedule(loan_id)?.active()[0].total_due();
    let receipt = loans.repay(loan_id, first, PaymentSource::Cash, "receipt-0001".into())?;
    println!("paid KES {}, outstanding: KES {}", receipt.applied, receipt.outstanding_after);

    println!("{}", loans.statement(loan_id)?.to_json_pretty()?);

    Ok(())
}
