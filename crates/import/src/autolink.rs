use std::collections::HashMap;

use ledgerline_core::{
    Direction, EntityLink, ExpenseRecord, Frequency, IncomeRecord, LinkOrigin, RecurringKey,
    RecurringPayment, UnifiedTransaction,
};

use crate::config::PipelineConfig;
use crate::util::{description_similarity, normalize_words};

/// A declared record a transaction may be linked to.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    link: EntityLink,
    name: &'a str,
    amount_cents: i64,
    frequency: Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkScore {
    pub link: EntityLink,
    pub confidence: f32,
}

pub struct AutoLinker {
    pub min_confidence: f32,
    pub amount_tolerance: f64,
    pub min_tolerance_cents: i64,
}

impl Default for AutoLinker {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl AutoLinker {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_confidence: config.auto_link_min_confidence,
            amount_tolerance: config.auto_link_amount_tolerance,
            min_tolerance_cents: config.auto_link_min_tolerance_cents,
        }
    }

    /// Links every unlinked transaction whose merchant and amount match a declared
    /// record closely enough. Incoming money only links to income records and
    /// outgoing money only to expenses. Returns the number of links made.
    ///
    /// `registry` supplies a known cadence per merchant so a monthly record can
    /// match a fortnightly payment.
    pub fn link_all(
        &self,
        transactions: &mut [UnifiedTransaction],
        income: &[IncomeRecord],
        expenses: &[ExpenseRecord],
        registry: &[RecurringPayment],
    ) -> usize {
        if income.is_empty() && expenses.is_empty() {
            return 0;
        }

        let income_targets: Vec<Target> = income
            .iter()
            .map(|r| Target {
                link: EntityLink::Income(r.id),
                name: &r.name,
                amount_cents: r.amount_cents,
                frequency: r.frequency,
            })
            .collect();
        let expense_targets: Vec<Target> = expenses
            .iter()
            .map(|r| Target {
                link: EntityLink::Expense(r.id),
                name: &r.name,
                amount_cents: r.amount_cents,
                frequency: r.frequency,
            })
            .collect();
        let cadence: HashMap<RecurringKey, Frequency> = registry
            .iter()
            .filter(|r| r.is_active)
            .map(|r| (r.key(), r.pattern))
            .collect();

        let mut linked = 0;
        for tx in transactions.iter_mut().filter(|t| t.link.is_none()) {
            let targets = match tx.direction {
                Direction::In => &income_targets,
                Direction::Out => &expense_targets,
            };
            let pattern = tx.recurrence_pattern.or_else(|| {
                cadence
                    .get(&RecurringKey {
                        merchant: tx.merchant.clone(),
                        account_id: tx.account_id,
                    })
                    .copied()
            });
            if let Some(best) = self.best_match(tx, pattern, targets) {
                tx.set_link(best.link, LinkOrigin::Auto);
                linked += 1;
            }
        }
        linked
    }

    fn best_match(
        &self,
        tx: &UnifiedTransaction,
        pattern: Option<Frequency>,
        targets: &[Target],
    ) -> Option<LinkScore> {
        targets
            .iter()
            .filter(|t| self.amount_matches(tx.amount_cents, t, pattern))
            .map(|t| LinkScore {
                link: t.link,
                confidence: name_confidence(&tx.merchant, t.name),
            })
            .filter(|s| s.confidence >= self.min_confidence)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.link.id().cmp(&a.link.id()))
            })
    }

    fn tolerance(&self, expected_cents: i64) -> i64 {
        let relative = (expected_cents.abs() as f64 * self.amount_tolerance).round() as i64;
        relative.max(self.min_tolerance_cents)
    }

    /// Compares against the declared amount and, when the transaction's cadence
    /// is known and differs, the amount converted to that cadence.
    fn amount_matches(&self, amount_cents: i64, target: &Target, pattern: Option<Frequency>) -> bool {
        let within = |expected: i64| (amount_cents - expected).abs() <= self.tolerance(expected);
        if within(target.amount_cents) {
            return true;
        }
        match pattern {
            Some(p) if p != target.frequency => {
                within(target.frequency.convert_amount(target.amount_cents, p))
            }
            _ => false,
        }
    }
}

/// Similarity of a standardized merchant and a record name in [0.0, 1.0].
/// A name whose words all appear in the merchant scores 0.9.
pub fn name_confidence(merchant: &str, name: &str) -> f32 {
    let m = normalize_words(merchant);
    let n = normalize_words(name);
    if m.is_empty() || n.is_empty() {
        return 0.0;
    }
    if m == n {
        return 1.0;
    }
    let merchant_words: Vec<&str> = m.split(' ').collect();
    let name_words: Vec<&str> = n.split(' ').collect();
    if name_words.iter().all(|w| merchant_words.contains(w))
        || merchant_words.iter().all(|w| name_words.contains(w))
    {
        return 0.9;
    }
    description_similarity(&m, &n)
}
