//! Per-user conversion quota accounting.
//!
//! Free units are a monthly allowance that resets when the billing month
//! changes. Paid units are lifetime credits. Free units are spent first.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Calendar month a free allowance belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

/// Which allowance a reservation was charged against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaUnit {
    Free,
    Paid,
}

/// Read-only snapshot of a user's quota for the current period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub plan: String,
    pub monthly_limit: u32,
    pub free_used: u32,
    pub paid_used: u32,
    pub remaining_free: u32,
    pub remaining_paid: u32,
}

impl QuotaState {
    pub fn has_remaining(&self) -> bool {
        self.remaining_free > 0 || self.remaining_paid > 0
    }

    pub fn total_remaining(&self) -> u32 {
        self.remaining_free.saturating_add(self.remaining_paid)
    }
}

/// Mutable quota account, owned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub plan: String,
    pub monthly_limit: u32,
    pub free_used: u32,
    pub paid_credits: u32,
    pub paid_used: u32,
    pub period: BillingPeriod,
}

impl QuotaAccount {
    pub fn new(plan: impl Into<String>, monthly_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            plan: plan.into(),
            monthly_limit,
            free_used: 0,
            paid_credits: 0,
            paid_used: 0,
            period: BillingPeriod::containing(now),
        }
    }

    pub fn with_paid_credits(mut self, credits: u32) -> Self {
        self.paid_credits = credits;
        self
    }

    /// Reset the free allowance if `now` falls in a later billing period.
    ///
    /// Returns `true` when a reset happened.
    pub fn roll_period(&mut self, now: DateTime<Utc>) -> bool {
        let current = BillingPeriod::containing(now);
        if current != self.period {
            self.period = current;
            self.free_used = 0;
            return true;
        }
        false
    }

    pub fn state(&self) -> QuotaState {
        QuotaState {
            plan: self.plan.clone(),
            monthly_limit: self.monthly_limit,
            free_used: self.free_used,
            paid_used: self.paid_used,
            remaining_free: self.monthly_limit.saturating_sub(self.free_used),
            remaining_paid: self.paid_credits.saturating_sub(self.paid_used),
        }
    }

    /// Consume one unit (free first), or `None` if nothing remains.
    pub fn try_consume(&mut self) -> Option<QuotaUnit> {
        if self.free_used < self.monthly_limit {
            self.free_used += 1;
            Some(QuotaUnit::Free)
        } else if self.paid_used < self.paid_credits {
            self.paid_used += 1;
            Some(QuotaUnit::Paid)
        } else {
            None
        }
    }

    pub fn grant_paid(&mut self, credits: u32) {
        self.paid_credits = self.paid_credits.saturating_add(credits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn free_units_are_spent_before_paid() {
        let mut account = QuotaAccount::new("starter", 2, at(2026, 3, 1)).with_paid_credits(1);

        assert_eq!(account.try_consume(), Some(QuotaUnit::Free));
        assert_eq!(account.try_consume(), Some(QuotaUnit::Free));
        assert_eq!(account.try_consume(), Some(QuotaUnit::Paid));
        assert_eq!(account.try_consume(), None);

        let state = account.state();
        assert_eq!(state.remaining_free, 0);
        assert_eq!(state.remaining_paid, 0);
        assert_eq!(state.paid_used, 1);
        assert!(!state.has_remaining());
    }

    #[test]
    fn new_month_resets_free_but_not_paid() {
        let mut account = QuotaAccount::new("free", 1, at(2026, 1, 31)).with_paid_credits(2);
        account.try_consume();
        account.try_consume();
        assert_eq!(account.state().remaining_free, 0);
        assert_eq!(account.state().remaining_paid, 1);

        assert!(!account.roll_period(at(2026, 1, 31)));
        assert!(account.roll_period(at(2026, 2, 1)));

        let state = account.state();
        assert_eq!(state.remaining_free, 1);
        assert_eq!(state.remaining_paid, 1);
        assert_eq!(state.total_remaining(), 2);
    }

    #[test]
    fn year_boundary_counts_as_new_period() {
        let mut account = QuotaAccount::new("free", 1, at(2025, 12, 31));
        account.try_consume();
        assert!(account.roll_period(at(2026, 12, 1)));
        assert_eq!(account.free_used, 0);
    }

    #[test]
    fn lowering_the_limit_never_underflows() {
        let mut account = QuotaAccount::new("pro", 5, at(2026, 5, 5));
        for _ in 0..4 {
            account.try_consume();
        }
        account.monthly_limit = 2;
        assert_eq!(account.state().remaining_free, 0);
        assert_eq!(account.try_consume(), None);
    }
}
