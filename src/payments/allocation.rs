use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::schedule::InstalmentScheduleEntry;

/// component of an instalment a payment can be applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationComponent {
    Penalty,
    Interest,
    Principal,
}

impl AllocationComponent {
    /// strict waterfall within a single entry
    pub const PRIORITY: [AllocationComponent; 3] = [
        AllocationComponent::Penalty,
        AllocationComponent::Interest,
        AllocationComponent::Principal,
    ];
}

/// credit applied to one instalment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub sequence: u32,
    pub to_penalty: Money,
    pub to_interest: Money,
    pub to_principal: Money,
}

impl AllocationLine {
    fn new(sequence: u32) -> Self {
        Self {
            sequence,
            to_penalty: Money::ZERO,
            to_interest: Money::ZERO,
            to_principal: Money::ZERO,
        }
    }

    pub fn total(&self) -> Money {
        self.to_penalty + self.to_interest + self.to_principal
    }

    fn slot(&mut self, component: AllocationComponent) -> &mut Money {
        match component {
            AllocationComponent::Penalty => &mut self.to_penalty,
            AllocationComponent::Interest => &mut self.to_interest,
            AllocationComponent::Principal => &mut self.to_principal,
        }
    }
}

/// result of mapping a payment onto a schedule
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub amount: Money,
    pub lines: Vec<AllocationLine>,
    /// money beyond the final entry, returned to the caller to route
    pub unapplied_excess: Money,
}

impl Allocation {
    pub fn total_applied(&self) -> Money {
        self.lines.iter().map(|l| l.total()).sum()
    }

    pub fn total_to(&self, component: AllocationComponent) -> Money {
        self.lines
            .iter()
            .map(|l| match component {
                AllocationComponent::Penalty => l.to_penalty,
                AllocationComponent::Interest => l.to_interest,
                AllocationComponent::Principal => l.to_principal,
            })
            .sum()
    }

    pub fn is_noop(&self) -> bool {
        self.lines.is_empty() && self.unapplied_excess.is_zero()
    }

    /// applied + excess must equal the payment exactly
    pub fn verify(&self) -> Result<()> {
        let accounted = self.total_applied() + self.unapplied_excess;
        if accounted != self.amount {
            return Err(LedgerError::invariant(format!(
                "allocation accounts for {} of a {} payment",
                accounted, self.amount
            )));
        }
        if self.unapplied_excess.is_negative() {
            return Err(LedgerError::invariant("negative unapplied excess"));
        }
        Ok(())
    }
}

/// maps repayments onto instalments
pub struct AllocationEngine;

impl AllocationEngine {
    /// allocate `amount` across the non-superseded entries, oldest due date
    /// first, penalty → interest → principal within each entry.
    ///
    /// Pure: the same entries and amount always give the same allocation.
    pub fn allocate(amount: Money, entries: &[InstalmentScheduleEntry]) -> Result<Allocation> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount { amount });
        }

        let mut ordered: Vec<&InstalmentScheduleEntry> =
            entries.iter().filter(|e| !e.is_superseded()).collect();
        ordered.sort_by_key(|e| (e.due_date, e.sequence));

        let mut remaining = amount;
        let mut lines = Vec::new();

        for entry in ordered {
            if remaining.is_zero() {
                break;
            }
            if entry.is_settled() {
                continue;
            }

            let mut line = AllocationLine::new(entry.sequence);
            for component in AllocationComponent::PRIORITY {
                let owed = match component {
                    AllocationComponent::Penalty => entry.penalty_outstanding(),
                    AllocationComponent::Interest => entry.interest_outstanding(),
                    AllocationComponent::Principal => entry.principal_outstanding(),
                };
                let applied = remaining.min(owed.max(Money::ZERO));
                *line.slot(component) += applied;
                remaining -= applied;
            }

            if line.total().is_positive() {
                lines.push(line);
            }
        }

        let allocation = Allocation {
            amount,
            lines,
            unapplied_excess: remaining,
        };
        allocation.verify()?;
        Ok(allocation)
    }
}
