use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ledgerline_core::{
    AccountId, CategoryRule, ExpenseRecord, ImportCounts, ImportFile, IncomeRecord, NewImportFile,
    RawTransactionRow, RecurringPayment, StoredTransaction, UnifiedTransaction, UserId,
};
use serde::Serialize;
use thiserror::Error;

use crate::recurring::RecurringDetection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Backend(String),
    #[error("Import file {0} not found")]
    ImportNotFound(i64),
    #[error("Import file {0} is no longer processing")]
    NotProcessing(i64),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

/// Result of the atomic hash check that opens an import.
#[derive(Debug, Clone)]
pub enum BeginImport {
    /// A fresh `PROCESSING` record.
    Created(ImportFile),
    /// Identical content was already imported and the policy forbids re-import.
    AlreadyImported { existing_id: i64 },
    /// Another attempt on the same content is still running.
    InProgress { existing_id: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportPage {
    pub items: Vec<ImportFile>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl ImportPage {
    /// Rows to skip for a 1-based `page`. Computed in `u64`, which cannot
    /// overflow for any pair of `u32` inputs.
    pub fn offset(page: u32, per_page: u32) -> u64 {
        u64::from(page.max(1) - 1) * u64::from(per_page.max(1))
    }
}

/// Everything the pipeline reads from and writes to persistent storage. All
/// reads and writes are scoped to one user.
#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Atomically per (user, content hash): rejects when a completed import with
    /// transactions exists (unless the policy allows re-import) or a fresh attempt
    /// is still processing, purges stale attempts, then creates the new record in
    /// `PROCESSING`.
    async fn begin_import(
        &self,
        new: NewImportFile,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<BeginImport, StoreError>;

    async fn insert_raw_rows(&self, rows: &[RawTransactionRow]) -> Result<(), StoreError>;

    async fn mark_raw_rows_processed(&self, import_file_id: i64) -> Result<(), StoreError>;

    async fn existing_transactions(&self, user_id: UserId) -> Result<Vec<StoredTransaction>, StoreError>;

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<StoredTransaction>, StoreError>;

    /// Active rules owned by the user plus active global rules.
    async fn load_active_rules(&self, user_id: UserId) -> Result<Vec<CategoryRule>, StoreError>;

    async fn income_records(&self, user_id: UserId) -> Result<Vec<IncomeRecord>, StoreError>;

    async fn expense_records(&self, user_id: UserId) -> Result<Vec<ExpenseRecord>, StoreError>;

    /// All-or-nothing batch insert. Returns the new ids in input order.
    async fn insert_transactions(&self, txs: &[UnifiedTransaction]) -> Result<Vec<i64>, StoreError>;

    async fn recurring_payments(&self, user_id: UserId) -> Result<Vec<RecurringPayment>, StoreError>;

    /// Inserts detected rows, overwrites updated ones and flags the listed
    /// transactions as recurring.
    async fn apply_recurring(
        &self,
        user_id: UserId,
        detection: &RecurringDetection,
    ) -> Result<(), StoreError>;

    async fn update_account_balance(
        &self,
        user_id: UserId,
        account_id: AccountId,
        balance_cents: i64,
    ) -> Result<(), StoreError>;

    async fn complete_import(
        &self,
        import_file_id: i64,
        counts: ImportCounts,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fail_import(
        &self,
        import_file_id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_import(&self, import_file_id: i64) -> Result<Option<ImportFile>, StoreError>;

    /// Newest first. `page` is 1-based.
    async fn list_imports(
        &self,
        user_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<ImportPage, StoreError>;
}
