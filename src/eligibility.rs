use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::LoanProduct;
use crate::types::{LoanId, LoanStatus, ProductId};

/// what the evaluator needs to know about one existing loan of the member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingLoan {
    pub loan_id: LoanId,
    pub product_id: ProductId,
    pub status: LoanStatus,
    /// true when any live instalment is overdue
    pub has_overdue: bool,
}

/// why an application was turned down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum DenialReason {
    /// product allows one loan at a time and the member already holds one
    ExistingLoanOnProduct { loan_id: LoanId, status: LoanStatus },
    /// product requires good standing and these loans have overdue instalments
    NotInGoodStanding { overdue_loans: Vec<LoanId> },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::ExistingLoanOnProduct { loan_id, status } => {
                write!(f, "member already holds loan {} ({:?}) on this product", loan_id, status)
            }
            DenialReason::NotInGoodStanding { overdue_loans } => {
                write!(f, "member has overdue instalments on {} loan(s)", overdue_loans.len())
            }
        }
    }
}

/// outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Allow,
    /// every rule that fired
    Deny(Vec<DenialReason>),
}

impl Eligibility {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Eligibility::Allow)
    }
}

/// pure application-time predicate over a member's loans and product rules
pub struct EligibilityEvaluator;

impl EligibilityEvaluator {
    pub fn evaluate(existing: &[ExistingLoan], product: &LoanProduct) -> Eligibility {
        let mut reasons = Vec::new();

        if !product.allow_multiple_loans {
            if let Some(held) = existing
                .iter()
                .find(|l| l.product_id == product.id && l.status.is_open())
            {
                reasons.push(DenialReason::ExistingLoanOnProduct {
                    loan_id: held.loan_id,
                    status: held.status,
                });
            }
        }

        if product.require_good_standing {
            let overdue_loans: Vec<LoanId> = existing
                .iter()
                .filter(|l| l.has_overdue)
                .map(|l| l.loan_id)
                .collect();
            if !overdue_loans.is_empty() {
                reasons.push(DenialReason::NotInGoodStanding { overdue_loans });
            }
        }

        if reasons.is_empty() {
            Eligibility::Allow
        } else {
            Eligibility::Deny(reasons)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn loan(product: &LoanProduct, status: LoanStatus, has_overdue: bool) -> ExistingLoan {
        ExistingLoan {
            loan_id: Uuid::new_v4(),
            product_id: product.id,
            status,
            has_overdue,
        }
    }

    #[test]
    fn test_overdue_entry_denies_good_standing_product() {
        let product = LoanProduct::development_loan().with_rules(true, true);
        let existing = vec![loan(&product, LoanStatus::Disbursed, true)];

        match EligibilityEvaluator::evaluate(&existing, &product) {
            Eligibility::Deny(reasons) => {
                assert_eq!(reasons.len(), 1);
                assert!(matches!(reasons[0], DenialReason::NotInGoodStanding { .. }));
            }
            Eligibility::Allow => panic!("expected a denial"),
        }
    }

    #[test]
    fn test_single_loan_rule_counts_open_statuses_only() {
        let product = LoanProduct::development_loan().with_rules(false, false);

        for status in [
            LoanStatus::Pending,
            LoanStatus::Approved,
            LoanStatus::Disbursed,
            LoanStatus::Defaulted,
            LoanStatus::Restructured,
        ] {
            let existing = vec![loan(&product, status, false)];
            assert!(!EligibilityEvaluator::evaluate(&existing, &product).is_allowed());
        }

        for status in [LoanStatus::Paid, LoanStatus::Completed, LoanStatus::Rejected] {
            let existing = vec![loan(&product, status, false)];
            assert!(EligibilityEvaluator::evaluate(&existing, &product).is_allowed());
        }
    }

    #[test]
    fn test_other_products_do_not_count() {
        let product = LoanProduct::development_loan().with_rules(false, false);
        let other = LoanProduct::emergency_loan();
        let existing = vec![loan(&other, LoanStatus::Disbursed, false)];
        assert!(EligibilityEvaluator::evaluate(&existing, &product).is_allowed());
    }

    #[test]
    fn test_all_firing_rules_reported() {
        let product = LoanProduct::development_loan();
        let other = LoanProduct::emergency_loan();
        let existing = vec![
            loan(&product, LoanStatus::Disbursed, false),
            loan(&other, LoanStatus::Defaulted, true),
        ];

        match EligibilityEvaluator::evaluate(&existing, &product) {
            Eligibility::Deny(reasons) => assert_eq!(reasons.len(), 2),
            Eligibility::Allow => panic!("expected a denial"),
        }
    }

    #[test]
    fn test_permissive_product_allows() {
        let product = LoanProduct::emergency_loan();
        let existing = vec![loan(&product, LoanStatus::Disbursed, true)];
        assert!(EligibilityEvaluator::evaluate(&existing, &product).is_allowed());
    }
}
