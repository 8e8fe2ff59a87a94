pub mod entry;
pub mod frequency;
pub mod generator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::payments::Allocation;
use crate::types::InstalmentStatus;

pub use entry::InstalmentScheduleEntry;
pub use frequency::{instalment_count, RepaymentFrequency};
pub use generator::{LoanTerms, ScheduleGenerator, ScheduleRequest, ScheduleTotals};

/// append-and-supersede instalment plan of one loan.
///
/// Entries are never removed or rewritten once superseded; a restructure
/// appends a new forward plan after the existing history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstalmentSchedule {
    entries: Vec<InstalmentScheduleEntry>,
}

impl InstalmentSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<InstalmentScheduleEntry>) -> Self {
        Self { entries }
    }

    /// every entry including superseded history
    pub fn entries(&self) -> &[InstalmentScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// non-superseded entries, oldest due date first
    pub fn active(&self) -> Vec<&InstalmentScheduleEntry> {
        let mut active: Vec<_> = self.entries.iter().filter(|e| !e.is_superseded()).collect();
        active.sort_by_key(|e| (e.due_date, e.sequence));
        active
    }

    pub fn superseded(&self) -> impl Iterator<Item = &InstalmentScheduleEntry> {
        self.entries.iter().filter(|e| e.is_superseded())
    }

    pub fn get(&self, sequence: u32) -> Option<&InstalmentScheduleEntry> {
        self.entries.iter().find(|e| e.sequence == sequence)
    }

    pub(crate) fn get_mut(&mut self, sequence: u32) -> Option<&mut InstalmentScheduleEntry> {
        self.entries.iter_mut().find(|e| e.sequence == sequence)
    }

    pub fn last_sequence(&self) -> u32 {
        self.entries.iter().map(|e| e.sequence).max().unwrap_or(0)
    }

    /// Σ(total_due − paid) over non-superseded entries
    pub fn outstanding(&self) -> Money {
        self.entries
            .iter()
            .filter(|e| !e.is_superseded())
            .map(|e| e.remaining())
            .sum()
    }

    /// Σ(principal_due − principal_paid) over non-superseded entries
    pub fn remaining_principal(&self) -> Money {
        self.entries
            .iter()
            .filter(|e| !e.is_superseded())
            .map(|e| e.principal_outstanding())
            .sum()
    }

    pub fn has_overdue(&self) -> bool {
        self.entries.iter().any(|e| e.status == InstalmentStatus::Overdue)
    }

    /// append freshly generated entries; sequences must continue the history
    pub fn append(&mut self, entries: Vec<InstalmentScheduleEntry>) -> Result<()> {
        let mut last = self.last_sequence();
        for entry in &entries {
            if entry.sequence <= last {
                return Err(LedgerError::invariant(format!(
                    "schedule sequence {} does not follow {}",
                    entry.sequence, last
                )));
            }
            last = entry.sequence;
        }
        self.entries.extend(entries);
        Ok(())
    }

    /// refresh statuses of every live entry as of the given date
    pub fn refresh_statuses(&mut self, as_of: DateTime<Utc>) {
        for entry in self.entries.iter_mut() {
            entry.refresh_status(as_of);
        }
    }

    /// mark every unpaid live entry superseded, returning copies of what was frozen
    pub(crate) fn supersede_open(&mut self) -> Vec<InstalmentScheduleEntry> {
        let mut frozen = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.is_superseded() || entry.is_settled() {
                continue;
            }
            entry.status = InstalmentStatus::Superseded;
            frozen.push(entry.clone());
        }
        frozen
    }

    /// credit an allocation onto the entries it names.
    ///
    /// Every line is checked against the entry's outstanding components
    /// before anything is written, so a bad allocation leaves the schedule
    /// untouched.
    pub fn apply_allocation(&mut self, allocation: &Allocation, as_of: DateTime<Utc>) -> Result<()> {
        for line in &allocation.lines {
            let entry = self
                .get(line.sequence)
                .ok_or_else(|| LedgerError::invariant(format!("allocation names unknown entry {}", line.sequence)))?;
            if entry.is_superseded() {
                return Err(LedgerError::invariant(format!(
                    "allocation targets superseded entry {}",
                    line.sequence
                )));
            }
            if line.to_penalty > entry.penalty_outstanding()
                || line.to_interest > entry.interest_outstanding()
                || line.to_principal > entry.principal_outstanding()
            {
                return Err(LedgerError::invariant(format!(
                    "allocation overpays entry {}",
                    line.sequence
                )));
            }
        }

        for line in &allocation.lines {
            if let Some(entry) = self.get_mut(line.sequence) {
                entry.penalty_paid += line.to_penalty;
                entry.interest_paid += line.to_interest;
                entry.principal_paid += line.to_principal;
                entry.refresh_status(as_of);
            }
        }

        Ok(())
    }
}
