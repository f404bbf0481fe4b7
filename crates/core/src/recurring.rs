use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::{AccountId, UserId};

/// Closed set of recurrence cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Weekly,
    Fortnightly,
    Monthly,
    Quarterly,
    Annually,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Weekly,
        Frequency::Fortnightly,
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::Annually,
    ];

    pub fn nominal_days(self) -> i64 {
        match self {
            Frequency::Weekly => 7,
            Frequency::Fortnightly => 14,
            Frequency::Monthly => 30,
            Frequency::Quarterly => 91,
            Frequency::Annually => 365,
        }
    }

    /// How far an observed interval may stray from `nominal_days` and still count.
    pub fn tolerance_days(self) -> i64 {
        match self {
            Frequency::Weekly => 2,
            Frequency::Fortnightly => 3,
            Frequency::Monthly => 4,
            Frequency::Quarterly => 10,
            Frequency::Annually => 20,
        }
    }

    pub fn periods_per_year(self) -> f64 {
        match self {
            Frequency::Weekly => 52.0,
            Frequency::Fortnightly => 26.0,
            Frequency::Monthly => 12.0,
            Frequency::Quarterly => 4.0,
            Frequency::Annually => 1.0,
        }
    }

    /// Next expected date after `date`. Calendar cadences follow month ends.
    pub fn advance(self, date: NaiveDate) -> NaiveDate {
        let next = match self {
            Frequency::Weekly => date.checked_add_signed(chrono::Duration::days(7)),
            Frequency::Fortnightly => date.checked_add_signed(chrono::Duration::days(14)),
            Frequency::Monthly => date.checked_add_months(Months::new(1)),
            Frequency::Quarterly => date.checked_add_months(Months::new(3)),
            Frequency::Annually => date.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(NaiveDate::MAX)
    }

    /// Re-expresses a per-period amount at another cadence via the annual total.
    pub fn convert_amount(self, cents: i64, to: Frequency) -> i64 {
        if self == to {
            return cents;
        }
        let annual = cents as f64 * self.periods_per_year();
        (annual / to.periods_per_year()).round() as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Weekly => "WEEKLY",
            Frequency::Fortnightly => "FORTNIGHTLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Quarterly => "QUARTERLY",
            Frequency::Annually => "ANNUALLY",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "WEEKLY" => Ok(Frequency::Weekly),
            "FORTNIGHTLY" => Ok(Frequency::Fortnightly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "QUARTERLY" => Ok(Frequency::Quarterly),
            "ANNUALLY" | "YEARLY" => Ok(Frequency::Annually),
            other => Err(format!("Unknown frequency: '{other}'")),
        }
    }
}

/// Registry key: one recurring series per merchant and account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecurringKey {
    pub merchant: String,
    pub account_id: Option<AccountId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringPayment {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub merchant: String,
    pub account_id: Option<AccountId>,
    pub pattern: Frequency,
    pub expected_amount_cents: i64,
    /// Largest relative deviation from the expected amount seen so far.
    pub amount_variance: f64,
    pub last_occurrence: NaiveDate,
    pub next_occurrence: NaiveDate,
    pub occurrence_count: u32,
    pub confidence: f32,
    pub is_active: bool,
    pub is_paused: bool,
    pub price_increase_alert: bool,
}

impl RecurringPayment {
    pub fn key(&self) -> RecurringKey {
        RecurringKey {
            merchant: self.merchant.clone(),
            account_id: self.account_id,
        }
    }

    /// Amount above which a new occurrence counts as a price increase.
    pub fn increase_threshold_cents(&self) -> i64 {
        let tolerance = (self.expected_amount_cents as f64 * self.amount_variance).round() as i64;
        self.expected_amount_cents + tolerance
    }

    /// Folds in a row detected for the same key by another run. Paused rows
    /// and observations that are not newer are left alone. Returns whether
    /// anything changed.
    pub fn absorb(&mut self, other: &RecurringPayment) -> bool {
        if self.is_paused || other.last_occurrence <= self.last_occurrence {
            return false;
        }
        self.pattern = other.pattern;
        self.expected_amount_cents = other.expected_amount_cents;
        self.amount_variance = other.amount_variance;
        self.last_occurrence = other.last_occurrence;
        self.next_occurrence = other.next_occurrence;
        self.occurrence_count = other.occurrence_count;
        self.confidence = other.confidence;
        self.is_active = other.is_active;
        self.price_increase_alert |= other.price_increase_alert;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn advance_monthly_clamps_to_month_end() {
        assert_eq!(Frequency::Monthly.advance(d(2024, 1, 31)), d(2024, 2, 29));
        assert_eq!(Frequency::Quarterly.advance(d(2024, 1, 15)), d(2024, 4, 15));
        assert_eq!(Frequency::Fortnightly.advance(d(2024, 1, 15)), d(2024, 1, 29));
    }

    #[test]
    fn convert_amount_through_annual_total() {
        assert_eq!(Frequency::Monthly.convert_amount(1200, Frequency::Annually), 14400);
        assert_eq!(Frequency::Weekly.convert_amount(10000, Frequency::Fortnightly), 20000);
        assert_eq!(Frequency::Annually.convert_amount(120000, Frequency::Monthly), 10000);
    }

    #[test]
    fn frequency_accepts_yearly_alias() {
        assert_eq!("yearly".parse::<Frequency>().unwrap(), Frequency::Annually);
        assert!("daily".parse::<Frequency>().is_err());
    }

    fn netflix() -> RecurringPayment {
        RecurringPayment {
            id: None,
            user_id: UserId(1),
            merchant: "NETFLIX.COM".to_string(),
            account_id: None,
            pattern: Frequency::Monthly,
            expected_amount_cents: 2000,
            amount_variance: 0.1,
            last_occurrence: d(2024, 1, 1),
            next_occurrence: d(2024, 2, 1),
            occurrence_count: 3,
            confidence: 1.0,
            is_active: true,
            is_paused: false,
            price_increase_alert: false,
        }
    }

    #[test]
    fn increase_threshold_applies_variance() {
        assert_eq!(netflix().increase_threshold_cents(), 2200);
    }

    #[test]
    fn absorb_takes_only_newer_observations() {
        let mut row = netflix();
        let mut stale = netflix();
        stale.expected_amount_cents = 9999;
        assert!(!row.absorb(&stale));
        assert_eq!(row.expected_amount_cents, 2000);

        let mut newer = netflix();
        newer.last_occurrence = d(2024, 2, 1);
        newer.next_occurrence = d(2024, 3, 1);
        newer.occurrence_count = 4;
        assert!(row.absorb(&newer));
        assert_eq!(row.occurrence_count, 4);
        assert_eq!(row.next_occurrence, d(2024, 3, 1));

        let mut paused = netflix();
        paused.is_paused = true;
        assert!(!paused.absorb(&newer));
        assert_eq!(paused.occurrence_count, 3);
    }
}
