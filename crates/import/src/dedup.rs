use std::collections::HashMap;

use ledgerline_core::{AnomalyFlag, Direction, DuplicatePolicy, NormalizedTransaction, StoredTransaction};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::normalize::is_placeholder;
use crate::util::description_similarity;

/// What an exact duplicate was a duplicate of.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateSource {
    /// An earlier row of the same file with the same fingerprint.
    WithinFile { first_row: usize },
    /// An already-stored transaction with the same fingerprint.
    Existing { transaction_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DuplicateStatus {
    Unique,
    Duplicate(DuplicateSource),
    PossibleDuplicate { transaction_id: i64, score: f32 },
}

impl DuplicateStatus {
    pub fn is_unique(&self) -> bool {
        matches!(self, DuplicateStatus::Unique)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateStats {
    pub unique: usize,
    pub duplicates: usize,
    pub possible_duplicates: usize,
}

/// Classification for each incoming transaction, in input order.
#[derive(Debug, Clone, Default)]
pub struct DuplicateReport {
    pub statuses: Vec<DuplicateStatus>,
    pub stats: DuplicateStats,
}

pub struct DuplicateDetector {
    pub window_days: i64,
    pub similarity_threshold: f32,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl DuplicateDetector {
    pub fn new(window_days: i64, similarity_threshold: f32) -> Self {
        Self {
            window_days,
            similarity_threshold,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.duplicate_window_days, config.duplicate_similarity)
    }

    /// Exact pass on fingerprints (same file first, then stored history), then a
    /// fuzzy pass against stored transactions sharing amount and direction.
    pub fn classify(
        &self,
        incoming: &[NormalizedTransaction],
        existing: &[StoredTransaction],
    ) -> DuplicateReport {
        let by_fingerprint: HashMap<&str, i64> = existing
            .iter()
            .map(|t| (t.fingerprint.as_str(), t.id))
            .collect();

        let mut buckets: HashMap<(i64, Direction), Vec<&StoredTransaction>> = HashMap::new();
        for t in existing {
            buckets
                .entry((t.amount_cents, t.direction))
                .or_default()
                .push(t);
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut report = DuplicateReport::default();

        for tx in incoming {
            let status = self.classify_one(tx, &mut seen, &by_fingerprint, &buckets);
            match status {
                DuplicateStatus::Unique => report.stats.unique += 1,
                DuplicateStatus::Duplicate(_) => report.stats.duplicates += 1,
                DuplicateStatus::PossibleDuplicate { .. } => report.stats.possible_duplicates += 1,
            }
            report.statuses.push(status);
        }
        report
    }

    fn classify_one<'a>(
        &self,
        tx: &'a NormalizedTransaction,
        seen: &mut HashMap<&'a str, usize>,
        by_fingerprint: &HashMap<&str, i64>,
        buckets: &HashMap<(i64, Direction), Vec<&StoredTransaction>>,
    ) -> DuplicateStatus {
        if is_placeholder(&tx.fingerprint) {
            return DuplicateStatus::Unique;
        }

        if let Some(&first_row) = seen.get(tx.fingerprint.as_str()) {
            return DuplicateStatus::Duplicate(DuplicateSource::WithinFile { first_row });
        }
        seen.insert(tx.fingerprint.as_str(), tx.row_number);

        if let Some(&transaction_id) = by_fingerprint.get(tx.fingerprint.as_str()) {
            return DuplicateStatus::Duplicate(DuplicateSource::Existing { transaction_id });
        }

        let Some(candidates) = buckets.get(&(tx.amount_cents, tx.direction)) else {
            return DuplicateStatus::Unique;
        };

        candidates
            .iter()
            .filter(|c| (c.date - tx.date).num_days().abs() <= self.window_days)
            .map(|c| (c.id, description_similarity(&tx.description, &c.description)))
            .filter(|(_, score)| *score >= self.similarity_threshold)
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.0.cmp(&a.0))
            })
            .map(|(transaction_id, score)| DuplicateStatus::PossibleDuplicate {
                transaction_id,
                score,
            })
            .unwrap_or(DuplicateStatus::Unique)
    }
}

/// Result of applying a [`DuplicatePolicy`] to classified transactions.
#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    /// Transactions to import, with the anomaly flag to attach, if any.
    pub kept: Vec<(NormalizedTransaction, Option<AnomalyFlag>)>,
    pub dropped: usize,
}

/// REJECT drops anything suspicious; MARK_DUPLICATE keeps everything and flags
/// it; SKIP drops exact duplicates but keeps and flags possible ones.
pub fn apply_policy(
    policy: DuplicatePolicy,
    transactions: Vec<NormalizedTransaction>,
    statuses: &[DuplicateStatus],
) -> PolicyOutcome {
    let mut outcome = PolicyOutcome::default();
    for (tx, status) in transactions.into_iter().zip(statuses) {
        let decision = match (policy, status) {
            (_, DuplicateStatus::Unique) => Some(None),
            (DuplicatePolicy::Reject, _) => None,
            (DuplicatePolicy::MarkDuplicate, DuplicateStatus::Duplicate(_)) => {
                Some(Some(AnomalyFlag::Duplicate))
            }
            (DuplicatePolicy::Skip, DuplicateStatus::Duplicate(_)) => None,
            (_, DuplicateStatus::PossibleDuplicate { .. }) => Some(Some(AnomalyFlag::PossibleDuplicate)),
        };
        match decision {
            Some(flag) => outcome.kept.push((tx, flag)),
            None => outcome.dropped += 1,
        }
    }
    outcome
}
