//! serialization support for loans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::loan::LoanAccount;
use crate::payments::RepaymentTransaction;
use crate::schedule::{InstalmentScheduleEntry, RepaymentFrequency};
use crate::types::{AccountId, InstalmentStatus, InterestMethod, LoanId, LoanStatus, MemberId, ProductId};

/// serializable view of a loan's state
#[derive(Debug, Serialize, Deserialize)]
pub struct LoanStatement {
    pub header: LoanHeader,
    pub balances: BalanceView,
    pub schedule: Vec<InstalmentScheduleEntry>,
    pub superseded_entries: usize,
    pub transactions: Vec<RepaymentTransaction>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoanHeader {
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub product_id: ProductId,
    pub product_name: String,
    pub status: LoanStatus,
    pub principal: Money,
    pub annual_rate: Rate,
    pub term_months: u32,
    pub frequency: RepaymentFrequency,
    pub interest_method: InterestMethod,
    pub outstanding_account: AccountId,
    pub applied_at: DateTime<Utc>,
    pub disbursed_at: Option<DateTime<Utc>>,
    pub restructure_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceView {
    pub outstanding: Money,
    pub principal_outstanding: Money,
    pub total_paid: Money,
    pub penalty_paid: Money,
    pub interest_paid: Money,
    pub principal_paid: Money,
    pub excess_returned: Money,
    pub next_due_date: Option<DateTime<Utc>>,
    pub next_due_amount: Option<Money>,
    pub overdue_instalments: usize,
}

impl LoanStatement {
    pub fn from_loan(loan: &LoanAccount, product_name: &str, generated_at: DateTime<Utc>) -> Self {
        let schedule = loan.schedule();
        let active = schedule.active();
        let transactions = loan.transactions();
        let next_due = active.iter().find(|e| !e.is_settled());

        LoanStatement {
            header: LoanHeader {
                loan_id: loan.id,
                member_id: loan.member_id,
                product_id: loan.product_id,
                product_name: product_name.to_string(),
                status: loan.status,
                principal: loan.principal,
                annual_rate: loan.terms.annual_rate,
                term_months: loan.terms.term_months,
                frequency: loan.terms.frequency,
                interest_method: loan.terms.interest_method,
                outstanding_account: loan.outstanding_account,
                applied_at: loan.applied_at,
                disbursed_at: loan.disbursed_at,
                restructure_count: loan.restructure_count,
            },
            balances: BalanceView {
                outstanding: loan.outstanding_balance(),
                principal_outstanding: schedule.remaining_principal(),
                total_paid: transactions.iter().map(|t| t.applied).sum(),
                penalty_paid: transactions.iter().map(|t| t.to_penalty()).sum(),
                interest_paid: transactions.iter().map(|t| t.to_interest()).sum(),
                principal_paid: transactions.iter().map(|t| t.to_principal()).sum(),
                excess_returned: transactions.iter().map(|t| t.unapplied_excess).sum(),
                next_due_date: next_due.map(|e| e.due_date),
                next_due_amount: next_due.map(|e| e.remaining()),
                overdue_instalments: active.iter().filter(|e| e.status == InstalmentStatus::Overdue).count(),
            },
            schedule: active.into_iter().cloned().collect(),
            superseded_entries: schedule.superseded().count(),
            transactions: transactions.to_vec(),
            generated_at,
        }
    }

    /// convert to pretty-printed json string
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::LoanTerms;
    use crate::types::PaymentSource;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_statement_json() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let terms = LoanTerms::new(Rate::from_percentage(12), 3, RepaymentFrequency::Monthly, InterestMethod::Flat);
        let mut loan = LoanAccount::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::from_major(3_000),
            terms,
            Uuid::new_v4(),
            now,
        )
        .unwrap();
        loan.approve(now).unwrap();
        loan.prepare_disbursement(now).unwrap();
        loan.mark_disbursed(Uuid::new_v4(), now).unwrap();
        let plan = loan.plan_repayment(Money::from_major(1_500), now).unwrap();
        loan.commit_repayment(
            plan,
            PaymentSource::MobileMoney {
                reference: "QJK21XYZ".to_string(),
            },
            "QJK21XYZ".into(),
            now,
        )
        .unwrap();

        let statement = LoanStatement::from_loan(&loan, "Development Loan", now);
        assert_eq!(statement.balances.outstanding, Money::from_major(1_590));
        assert_eq!(statement.balances.interest_paid, Money::from_major(60));
        assert_eq!(statement.header.status, LoanStatus::Disbursed);
        assert_eq!(statement.superseded_entries, 0);

        let json = statement.to_json_pretty().unwrap();
        assert!(json.contains("\"product_name\": \"Development Loan\""));
        assert!(json.contains("\"type\": \"mobile_money\""));
        assert!(json.contains("\"frequency\": \"monthly\""));
    }
}
