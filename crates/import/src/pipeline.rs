use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use ledgerline_core::{
    AccountId, DateRange, DuplicatePolicy, EntityLink, FileFormat, ImportCounts, ImportFile,
    LinkOrigin, NewImportFile, RawTransactionRow, RecurringKey, UnifiedTransaction, UserId,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::autolink::AutoLinker;
use crate::config::PipelineConfig;
use crate::csv::ParseOptions;
use crate::dedup::{apply_policy, DuplicateDetector};
use crate::hash;
use crate::heuristics::FallbackClassifier;
use crate::normalize::{normalize_rows, row_fingerprint};
use crate::parser::{self, ParseError, ParsedFile, RowError};
use crate::recurring::{RecurringDetection, RecurringDetector};
use crate::rules::CategoryRuleEngine;
use crate::store::{BeginImport, ImportStore, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid import request: {0}")]
    Validation(String),
    #[error("Statement was already imported (import {existing_import_id})")]
    Conflict { existing_import_id: i64 },
    #[error("Statement is already being imported (import {existing_import_id})")]
    InProgress { existing_import_id: i64 },
    #[error("{0} import is not implemented yet")]
    NotImplemented(FileFormat),
    #[error("Could not parse statement: {0}")]
    Parse(ParseError),
    #[error("Import {import_file_id} failed: {message}")]
    Stage { import_file_id: i64, message: String },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ParseError> for PipelineError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::NotImplemented(format) => PipelineError::NotImplemented(format),
            ParseError::InvalidOptions(msg) => PipelineError::Validation(msg),
            other => PipelineError::Parse(other),
        }
    }
}

/// One uploaded statement plus the caller's choices for it.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub user_id: UserId,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Overrides detection from the filename extension.
    pub format: Option<FileFormat>,
    pub account_id: Option<AccountId>,
    pub duplicate_policy: DuplicatePolicy,
    pub options: ParseOptions,
    pub update_balance: bool,
    pub auto_link: bool,
    /// Row number → income or expense record chosen by the user.
    pub links: HashMap<usize, EntityLink>,
}

impl ImportRequest {
    pub fn new(user_id: UserId, filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            user_id,
            filename: filename.into(),
            bytes: bytes.into(),
            format: None,
            account_id: None,
            duplicate_policy: DuplicatePolicy::default(),
            options: ParseOptions::default(),
            update_balance: false,
            auto_link: true,
            links: HashMap::new(),
        }
    }

    /// Checks everything that can be checked before touching storage.
    fn validate(&self) -> Result<FileFormat, PipelineError> {
        if self.filename.trim().is_empty() {
            return Err(PipelineError::Validation("filename is required".into()));
        }
        if self.bytes.is_empty() {
            return Err(PipelineError::Validation("file is empty".into()));
        }
        let format = self
            .format
            .or_else(|| FileFormat::from_filename(&self.filename))
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "cannot tell the format of '{}'; expected .csv, .ofx, .qfx or .qif",
                    self.filename
                ))
            })?;
        if self.update_balance && self.account_id.is_none() {
            return Err(PipelineError::Validation(
                "update_balance needs an account_id".into(),
            ));
        }
        for (row, link) in &self.links {
            if *row == 0 {
                return Err(PipelineError::Validation("link row numbers start at 1".into()));
            }
            if !matches!(link, EntityLink::Income(_) | EntityLink::Expense(_)) {
                return Err(PipelineError::Validation(format!(
                    "row {row}: only income or expense links can be supplied, got {}",
                    link.kind()
                )));
            }
        }
        self.options.validate()?;
        Ok(format)
    }
}

/// What an import did, returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub import_file_id: i64,
    pub total_rows: usize,
    pub imported: usize,
    /// Exact plus possible duplicates, whatever the policy did with them.
    pub duplicates: usize,
    pub possible_duplicates: usize,
    pub errors: usize,
    pub categorized: usize,
    pub uncategorized: usize,
    pub auto_linked: usize,
    pub recurring_detected: usize,
    pub closing_balance_applied: bool,
    /// The first few row errors, in row order.
    pub row_errors: Vec<RowError>,
}

/// Orchestrates: validate → hash → parse → open import → raw rows → normalize →
/// dedup → policy → categorize → link → persist → recurring → balance → complete.
pub struct ImportPipeline {
    store: Arc<dyn ImportStore>,
    config: PipelineConfig,
    fallback: Option<Arc<dyn FallbackClassifier>>,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn ImportStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackClassifier>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn store(&self) -> &Arc<dyn ImportStore> {
        &self.store
    }

    /// Imports one statement. Nothing is persisted when validation or parsing of
    /// the file as a whole fails; once the import record exists it always ends
    /// `COMPLETED` or `FAILED`.
    pub async fn import(&self, req: ImportRequest) -> Result<ImportSummary, PipelineError> {
        let format = req.validate()?;

        let text = parser::decode(&req.bytes);
        let content_hash = hash::content_hash(&text);
        let parsed = parser::parse_statement(&text, format, &req.options)?;
        debug!(
            rows = parsed.rows.len(),
            errors = parsed.errors.len(),
            "statement parsed"
        );

        let new = NewImportFile {
            user_id: req.user_id,
            filename: req.filename.clone(),
            format,
            byte_size: u64::try_from(req.bytes.len()).unwrap_or(u64::MAX),
            content_hash,
            duplicate_policy: req.duplicate_policy,
            account_id: req.account_id,
        };
        let file = match self
            .store
            .begin_import(new, Utc::now(), self.config.stale_after())
            .await?
        {
            BeginImport::Created(file) => file,
            BeginImport::AlreadyImported { existing_id } => {
                warn!(user = %req.user_id, existing_id, "rejecting re-import of identical statement");
                return Err(PipelineError::Conflict {
                    existing_import_id: existing_id,
                });
            }
            BeginImport::InProgress { existing_id } => {
                warn!(user = %req.user_id, existing_id, "statement import already in progress");
                return Err(PipelineError::InProgress {
                    existing_import_id: existing_id,
                });
            }
        };
        info!(
            import_file_id = file.id,
            user = %req.user_id,
            filename = %file.filename,
            policy = %req.duplicate_policy.as_str(),
            "import started"
        );

        match self.run_stages(&file, &req, parsed).await {
            Ok(summary) => {
                info!(
                    import_file_id = file.id,
                    imported = summary.imported,
                    duplicates = summary.duplicates,
                    errors = summary.errors,
                    "import completed"
                );
                Ok(summary)
            }
            Err(e) => {
                let message = e.to_string();
                error!(import_file_id = file.id, error = ?e, "import failed");
                if let Err(mark) = self.store.fail_import(file.id, &message, Utc::now()).await {
                    error!(import_file_id = file.id, error = %mark, "could not mark import as failed");
                }
                Err(PipelineError::Stage {
                    import_file_id: file.id,
                    message,
                })
            }
        }
    }

    async fn run_stages(
        &self,
        file: &ImportFile,
        req: &ImportRequest,
        parsed: ParsedFile,
    ) -> Result<ImportSummary, StoreError> {
        let user_id = req.user_id;

        // 1. Raw rows, kept as the audit trail even if later stages fail.
        let raw: Vec<RawTransactionRow> = parsed
            .rows
            .iter()
            .map(|row| RawTransactionRow {
                import_file_id: file.id,
                row_number: row.row_number,
                fields: row.fields.clone(),
                row_hash: row.row_hash.clone(),
                fingerprint: row_fingerprint(row),
                processed: false,
            })
            .collect();
        self.store.insert_raw_rows(&raw).await?;

        // 2. Normalize.
        let normalized = normalize_rows(parsed.valid_rows());

        // 3. Duplicates.
        let existing = self.store.existing_transactions(user_id).await?;
        let report = DuplicateDetector::from_config(&self.config).classify(&normalized, &existing);
        debug!(
            import_file_id = file.id,
            unique = report.stats.unique,
            duplicates = report.stats.duplicates,
            possible = report.stats.possible_duplicates,
            "duplicate detection done"
        );

        // 4. Policy.
        let outcome = apply_policy(req.duplicate_policy, normalized, &report.statuses);

        // 5. Categorize, seed rule links, apply explicit links.
        let rules = self.store.load_active_rules(user_id).await?;
        let mut engine = CategoryRuleEngine::new(rules, user_id);
        if let Some(fallback) = &self.fallback {
            engine = engine.with_fallback(Arc::clone(fallback));
        }
        debug!(import_file_id = file.id, rules = engine.len(), "rule engine ready");

        let mut transactions: Vec<UnifiedTransaction> = Vec::with_capacity(outcome.kept.len());
        for (tx, flag) in outcome.kept {
            let categorization = engine.categorize(&tx);
            let row_number = tx.row_number;
            let mut unified = UnifiedTransaction::from_normalized(tx, user_id, req.account_id, file.id);
            unified.category = categorization.category;
            unified.confidence = categorization.confidence;
            unified.rule_id = categorization.rule_id;
            unified.anomaly_flags.extend(flag);

            match req.links.get(&row_number) {
                Some(link) if link.is_valid_for(unified.direction) => {
                    unified.set_link(*link, LinkOrigin::User);
                }
                Some(link) => {
                    warn!(
                        import_file_id = file.id,
                        row = row_number,
                        link = link.kind(),
                        direction = %unified.direction,
                        "ignoring link that does not fit the transaction direction"
                    );
                    if let Some(seeded) = categorization.link {
                        unified.set_link(seeded, LinkOrigin::Rule);
                    }
                }
                None => {
                    if let Some(seeded) = categorization.link {
                        unified.set_link(seeded, LinkOrigin::Rule);
                    }
                }
            }
            transactions.push(unified);
        }

        // 6. Auto-link. Cadences inferred from history plus this file let a
        //    fortnightly payment meet a monthly record on its first import.
        let mut auto_linked = 0;
        let newest = transactions.iter().map(|t| t.date).max();
        if let Some(as_of) = newest.filter(|_| req.auto_link) {
            let since = DateRange::trailing_months(as_of, self.config.recurring_lookback_months).start;
            let mut history = self.store.transactions_since(user_id, since).await?;
            history.extend(transactions.iter().map(|t| t.to_stored(0)));
            let cadences = RecurringDetector::from_config(&self.config).cadences(&history, as_of);
            for tx in transactions.iter_mut() {
                let key = RecurringKey {
                    merchant: tx.merchant.clone(),
                    account_id: tx.account_id,
                };
                if let Some(pattern) = cadences.get(&key) {
                    tx.is_recurring = true;
                    tx.recurrence_pattern = Some(*pattern);
                }
            }

            let income = self.store.income_records(user_id).await?;
            let expenses = self.store.expense_records(user_id).await?;
            let registry = self.store.recurring_payments(user_id).await?;
            auto_linked = AutoLinker::from_config(&self.config).link_all(
                &mut transactions,
                &income,
                &expenses,
                &registry,
            );
        }

        // 7. Persist.
        let ids = if transactions.is_empty() {
            Vec::new()
        } else {
            self.store.insert_transactions(&transactions).await?
        };
        self.store.mark_raw_rows_processed(file.id).await?;

        // 8. Recurring patterns, as of the newest imported transaction.
        let mut recurring_detected = 0;
        if let Some(as_of) = newest {
            let detection = self.detect_and_apply(user_id, as_of).await?;
            recurring_detected = detection.detected.len();
        }

        // 9. Closing balance.
        let mut closing_balance_applied = false;
        if req.update_balance {
            if let (Some(account_id), Some(balance)) = (req.account_id, parsed.closing_balance_cents) {
                self.store
                    .update_account_balance(user_id, account_id, balance)
                    .await?;
                closing_balance_applied = true;
            }
        }

        // 10. Complete.
        let categorized = transactions.iter().filter(|t| t.is_categorized()).count();
        let summary = ImportSummary {
            import_file_id: file.id,
            total_rows: parsed.total_rows,
            imported: ids.len(),
            duplicates: report.stats.duplicates + report.stats.possible_duplicates,
            possible_duplicates: report.stats.possible_duplicates,
            errors: parsed.errors.len(),
            categorized,
            uncategorized: transactions.len() - categorized,
            auto_linked,
            recurring_detected,
            closing_balance_applied,
            row_errors: parsed
                .errors
                .iter()
                .take(self.config.max_reported_errors)
                .cloned()
                .collect(),
        };
        let counts = ImportCounts::new(
            summary.total_rows,
            summary.imported,
            summary.duplicates,
            summary.errors,
        );
        self.store.complete_import(file.id, counts, Utc::now()).await?;
        Ok(summary)
    }

    /// Recurring detection for one user outside of an import. Idempotent.
    pub async fn run_recurring_detection(
        &self,
        user_id: UserId,
        as_of: NaiveDate,
    ) -> Result<RecurringDetection, PipelineError> {
        let detection = self.detect_and_apply(user_id, as_of).await?;
        info!(
            user = %user_id,
            detected = detection.detected.len(),
            updated = detection.updated.len(),
            "recurring detection run"
        );
        Ok(detection)
    }

    async fn detect_and_apply(
        &self,
        user_id: UserId,
        as_of: NaiveDate,
    ) -> Result<RecurringDetection, StoreError> {
        let since = DateRange::trailing_months(as_of, self.config.recurring_lookback_months).start;
        let history = self.store.transactions_since(user_id, since).await?;
        let registry = self.store.recurring_payments(user_id).await?;
        let detection =
            RecurringDetector::from_config(&self.config).detect(user_id, &history, &registry, as_of);
        if !detection.is_empty() {
            self.store.apply_recurring(user_id, &detection).await?;
        }
        debug!(
            user = %user_id,
            detected = detection.detected.len(),
            updated = detection.updated.len(),
            flagged = detection.recurring_transactions.len(),
            "recurring detection applied"
        );
        Ok(detection)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
