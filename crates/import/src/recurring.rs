use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use ledgerline_core::{
    DateRange, Direction, Frequency, RecurringKey, RecurringPayment, StoredTransaction, UserId,
};
use serde::Serialize;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::util::median_cents;

const REGULARITY_WEIGHT: f32 = 0.6;
const STABILITY_WEIGHT: f32 = 0.4;
/// Amounts used for the rolling expected amount on updates.
const RECENT_AMOUNTS: usize = 3;

/// Registry changes produced by one detection run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecurringDetection {
    /// Newly created registry rows (no id yet).
    pub detected: Vec<RecurringPayment>,
    /// Existing registry rows whose fields changed, including deactivations.
    pub updated: Vec<RecurringPayment>,
    /// Every transaction in a recurring group, with the group's cadence.
    pub recurring_transactions: Vec<(i64, Frequency)>,
}

impl RecurringDetection {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.updated.is_empty() && self.recurring_transactions.is_empty()
    }
}

/// Cadence and amount statistics of one merchant/account group.
#[derive(Debug, Clone, PartialEq)]
struct GroupAnalysis {
    pattern: Frequency,
    confidence: f32,
}

pub struct RecurringDetector {
    pub min_occurrences: usize,
    pub lookback_months: u32,
    pub min_confidence: f32,
}

impl Default for RecurringDetector {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RecurringDetector {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_occurrences: config.recurring_min_occurrences.max(2),
            lookback_months: config.recurring_lookback_months,
            min_confidence: config.recurring_min_confidence,
        }
    }

    /// Runs detection over a user's transactions as of `as_of`.
    ///
    /// Re-running on unchanged data produces no registry changes: updates only
    /// happen when a group has an occurrence newer than the registry's last one.
    pub fn detect(
        &self,
        user_id: UserId,
        transactions: &[StoredTransaction],
        registry: &[RecurringPayment],
        as_of: NaiveDate,
    ) -> RecurringDetection {
        let groups = self.group(transactions, as_of);

        let by_key: HashMap<RecurringKey, &RecurringPayment> =
            registry.iter().map(|r| (r.key(), r)).collect();

        let mut out = RecurringDetection::default();
        let mut touched: HashSet<RecurringKey> = HashSet::new();

        for (key, mut txs) in groups {
            if txs.len() < self.min_occurrences {
                continue;
            }
            txs.sort_by_key(|t| (t.date, t.id));

            let Some(analysis) = self.analyze(&txs) else {
                continue;
            };
            out.recurring_transactions
                .extend(txs.iter().map(|t| (t.id, analysis.pattern)));

            match by_key.get(&key) {
                Some(existing) => {
                    if let Some(updated) = update_existing(existing, &txs, &analysis) {
                        debug!(merchant = %key.merchant, "recurring payment updated");
                        out.updated.push(updated);
                    }
                    touched.insert(key);
                }
                None => {
                    debug!(merchant = %key.merchant, pattern = %analysis.pattern, "recurring payment detected");
                    out.detected.push(fresh_payment(user_id, key, &txs, &analysis));
                }
            }
        }

        for payment in registry {
            if !payment.is_active || touched.contains(&payment.key()) {
                continue;
            }
            let grace = Duration::days(payment.pattern.nominal_days() * 2);
            if payment.next_occurrence + grace < as_of {
                let mut lapsed = payment.clone();
                lapsed.is_active = false;
                out.updated.push(lapsed);
            }
        }

        out
    }

    /// Cadence of every recurring group in `transactions`, without consulting
    /// or changing a registry.
    pub fn cadences(
        &self,
        transactions: &[StoredTransaction],
        as_of: NaiveDate,
    ) -> HashMap<RecurringKey, Frequency> {
        self.group(transactions, as_of)
            .into_iter()
            .filter(|(_, txs)| txs.len() >= self.min_occurrences)
            .filter_map(|(key, mut txs)| {
                txs.sort_by_key(|t| (t.date, t.id));
                self.analyze(&txs).map(|a| (key, a.pattern))
            })
            .collect()
    }

    /// In-window transactions by merchant and account. Each group keeps only
    /// its dominant direction, so a stray refund never joins a subscription
    /// series and salary credits form their own.
    fn group<'a>(
        &self,
        transactions: &'a [StoredTransaction],
        as_of: NaiveDate,
    ) -> BTreeMap<RecurringKey, Vec<&'a StoredTransaction>> {
        let window = DateRange::trailing_months(as_of, self.lookback_months);

        let mut groups: BTreeMap<RecurringKey, Vec<&StoredTransaction>> = BTreeMap::new();
        for tx in transactions {
            if tx.merchant.is_empty() || !window.contains(tx.date) {
                continue;
            }
            groups
                .entry(RecurringKey {
                    merchant: tx.merchant.clone(),
                    account_id: tx.account_id,
                })
                .or_default()
                .push(tx);
        }
        for txs in groups.values_mut() {
            let outgoing = txs.iter().filter(|t| t.direction == Direction::Out).count();
            let dominant = if outgoing * 2 >= txs.len() {
                Direction::Out
            } else {
                Direction::In
            };
            txs.retain(|t| t.direction == dominant);
        }
        groups
    }

    fn analyze(&self, txs: &[&StoredTransaction]) -> Option<GroupAnalysis> {
        let intervals: Vec<i64> = txs
            .windows(2)
            .map(|w| (w[1].date - w[0].date).num_days())
            .collect();
        if intervals.is_empty() {
            return None;
        }

        let typical = median_cents(&intervals);
        let pattern = Frequency::ALL
            .into_iter()
            .filter(|f| (typical - f.nominal_days()).abs() <= f.tolerance_days())
            .min_by_key(|f| (typical - f.nominal_days()).abs())?;

        let regular = intervals
            .iter()
            .filter(|i| (**i - pattern.nominal_days()).abs() <= pattern.tolerance_days())
            .count();
        let regularity = regular as f32 / intervals.len() as f32;

        let amounts: Vec<i64> = txs.iter().map(|t| t.amount_cents).collect();
        let variance = max_relative_deviation(&amounts, median_cents(&amounts));
        let stability = 1.0 - variance.min(1.0) as f32;

        let confidence = REGULARITY_WEIGHT * regularity + STABILITY_WEIGHT * stability;
        if confidence < self.min_confidence {
            return None;
        }
        Some(GroupAnalysis {
            pattern,
            confidence,
        })
    }
}

fn max_relative_deviation(amounts: &[i64], expected: i64) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    amounts
        .iter()
        .map(|a| (a - expected).abs() as f64 / expected as f64)
        .fold(0.0, f64::max)
}

/// First sighting of a group. If the latest amount already breaks the range
/// established by the earlier ones, the row starts with the price alert set.
fn fresh_payment(
    user_id: UserId,
    key: RecurringKey,
    txs: &[&StoredTransaction],
    analysis: &GroupAnalysis,
) -> RecurringPayment {
    let amounts: Vec<i64> = txs.iter().map(|t| t.amount_cents).collect();
    let (latest, baseline) = match amounts.split_last() {
        Some((latest, baseline)) => (*latest, baseline),
        None => (0, &[][..]),
    };
    let base_expected = median_cents(baseline);
    let base_variance = max_relative_deviation(baseline, base_expected);
    let base_threshold = base_expected + (base_expected as f64 * base_variance).round() as i64;

    let (expected, variance, alert) = if base_expected > 0 && latest > base_threshold {
        (latest, base_variance, true)
    } else {
        let expected = median_cents(&amounts);
        (expected, max_relative_deviation(&amounts, expected), false)
    };

    let last = txs.last().map(|t| t.date).unwrap_or(NaiveDate::MIN);
    RecurringPayment {
        id: None,
        user_id,
        merchant: key.merchant,
        account_id: key.account_id,
        pattern: analysis.pattern,
        expected_amount_cents: expected,
        amount_variance: variance,
        last_occurrence: last,
        next_occurrence: analysis.pattern.advance(last),
        occurrence_count: u32::try_from(txs.len()).unwrap_or(u32::MAX),
        confidence: analysis.confidence,
        is_active: true,
        is_paused: false,
        price_increase_alert: alert,
    }
}

/// Folds occurrences newer than the registry's last one into it. Returns
/// `None` when there is nothing new, which makes re-runs converge.
fn update_existing(
    existing: &RecurringPayment,
    txs: &[&StoredTransaction],
    analysis: &GroupAnalysis,
) -> Option<RecurringPayment> {
    if existing.is_paused {
        return None;
    }
    let new_count = txs
        .iter()
        .filter(|t| t.date > existing.last_occurrence)
        .count();
    let latest = txs.last().filter(|t| t.date > existing.last_occurrence)?;

    let mut next = existing.clone();
    if latest.amount_cents > existing.increase_threshold_cents() {
        next.price_increase_alert = true;
        next.expected_amount_cents = latest.amount_cents;
    } else {
        let recent: Vec<i64> = txs
            .iter()
            .rev()
            .take(RECENT_AMOUNTS)
            .map(|t| t.amount_cents)
            .collect();
        next.expected_amount_cents = median_cents(&recent);
        if existing.expected_amount_cents > 0 {
            let deviation = (latest.amount_cents - existing.expected_amount_cents).abs() as f64
                / existing.expected_amount_cents as f64;
            next.amount_variance = existing.amount_variance.max(deviation);
        }
    }

    next.pattern = analysis.pattern;
    next.confidence = analysis.confidence;
    next.occurrence_count = existing
        .occurrence_count
        .saturating_add(u32::try_from(new_count).unwrap_or(u32::MAX));
    next.last_occurrence = latest.date;
    next.next_occurrence = analysis.pattern.advance(latest.date);
    next.is_active = true;
    Some(next)
}
