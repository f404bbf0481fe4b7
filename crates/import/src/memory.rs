use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ledgerline_core::{
    Account, AccountId, CategoryRule, ExpenseRecord, ImportCounts, ImportFile, ImportStatus,
    IncomeRecord, Money, NewImportFile, RawTransactionRow, RecurringPayment, StoredTransaction,
    UnifiedTransaction, UserId,
};
use tokio::sync::Mutex;

use crate::recurring::RecurringDetection;
use crate::store::{BeginImport, ImportPage, ImportStore, StoreError};

#[derive(Default)]
struct State {
    next_id: i64,
    imports: BTreeMap<i64, ImportFile>,
    raw_rows: Vec<RawTransactionRow>,
    transactions: Vec<UnifiedTransaction>,
    rules: Vec<CategoryRule>,
    income: Vec<IncomeRecord>,
    expenses: Vec<ExpenseRecord>,
    recurring: Vec<RecurringPayment>,
    accounts: BTreeMap<AccountId, Account>,
    fail_transaction_inserts: bool,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn processing_import(&mut self, id: i64) -> Result<&mut ImportFile, StoreError> {
        let file = self
            .imports
            .get_mut(&id)
            .ok_or(StoreError::ImportNotFound(id))?;
        if file.status != ImportStatus::Processing {
            return Err(StoreError::NotProcessing(id));
        }
        Ok(file)
    }
}

fn project(tx: &UnifiedTransaction) -> Option<StoredTransaction> {
    tx.id.map(|id| tx.to_stored(id))
}

/// In-process [`ImportStore`]. One lock guards all state, so every operation is
/// atomic. Used by tests and by the server when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, user_id: UserId, name: &str, balance_cents: i64) -> AccountId {
        let mut state = self.state.lock().await;
        let id = AccountId(state.allocate_id());
        state.accounts.insert(
            id,
            Account {
                id,
                user_id,
                name: name.to_string(),
                balance: Money::from_cents(balance_cents),
            },
        );
        id
    }

    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.state.lock().await.accounts.get(&id).cloned()
    }

    /// Stores a rule, assigning an id when it has none (id 0).
    pub async fn add_rule(&self, mut rule: CategoryRule) -> i64 {
        let mut state = self.state.lock().await;
        if rule.id == 0 {
            rule.id = state.allocate_id();
        }
        let id = rule.id;
        state.rules.push(rule);
        id
    }

    pub async fn add_income(&self, mut record: IncomeRecord) -> i64 {
        let mut state = self.state.lock().await;
        if record.id == 0 {
            record.id = state.allocate_id();
        }
        let id = record.id;
        state.income.push(record);
        id
    }

    pub async fn add_expense(&self, mut record: ExpenseRecord) -> i64 {
        let mut state = self.state.lock().await;
        if record.id == 0 {
            record.id = state.allocate_id();
        }
        let id = record.id;
        state.expenses.push(record);
        id
    }

    pub async fn transactions(&self, user_id: UserId) -> Vec<UnifiedTransaction> {
        let state = self.state.lock().await;
        state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn raw_rows(&self, import_file_id: i64) -> Vec<RawTransactionRow> {
        let state = self.state.lock().await;
        state
            .raw_rows
            .iter()
            .filter(|r| r.import_file_id == import_file_id)
            .cloned()
            .collect()
    }

    /// Makes every following transaction insert fail, to exercise stage failures.
    pub async fn fail_transaction_inserts(&self, fail: bool) {
        self.state.lock().await.fail_transaction_inserts = fail;
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn begin_import(
        &self,
        new: NewImportFile,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<BeginImport, StoreError> {
        let mut state = self.state.lock().await;

        let same: Vec<&ImportFile> = state
            .imports
            .values()
            .filter(|f| f.user_id == new.user_id && f.content_hash == new.content_hash)
            .collect();

        if !new.duplicate_policy.allows_reimport() {
            if let Some(done) = same.iter().find(|f| f.is_fully_imported()) {
                return Ok(BeginImport::AlreadyImported {
                    existing_id: done.id,
                });
            }
        }
        if let Some(running) = same
            .iter()
            .find(|f| f.status == ImportStatus::Processing && !f.is_purgeable(now, stale_after))
        {
            return Ok(BeginImport::InProgress {
                existing_id: running.id,
            });
        }

        let purge: Vec<i64> = same
            .iter()
            .filter(|f| f.is_purgeable(now, stale_after))
            .map(|f| f.id)
            .collect();
        for id in purge {
            state.imports.remove(&id);
        }

        let id = state.allocate_id();
        let file = ImportFile {
            id,
            user_id: new.user_id,
            filename: new.filename,
            format: new.format,
            byte_size: new.byte_size,
            content_hash: new.content_hash,
            status: ImportStatus::Processing,
            counts: ImportCounts::default(),
            duplicate_policy: new.duplicate_policy,
            account_id: new.account_id,
            error_message: None,
            uploaded_at: now,
            processed_at: None,
        };
        state.imports.insert(id, file.clone());
        Ok(BeginImport::Created(file))
    }

    async fn insert_raw_rows(&self, rows: &[RawTransactionRow]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.raw_rows.extend_from_slice(rows);
        Ok(())
    }

    async fn mark_raw_rows_processed(&self, import_file_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .raw_rows
            .iter_mut()
            .filter(|r| r.import_file_id == import_file_id)
            .for_each(|r| r.processed = true);
        Ok(())
    }

    async fn existing_transactions(&self, user_id: UserId) -> Result<Vec<StoredTransaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter_map(project)
            .collect())
    }

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<StoredTransaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.date >= since)
            .filter_map(project)
            .collect())
    }

    async fn load_active_rules(&self, user_id: UserId) -> Result<Vec<CategoryRule>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rules
            .iter()
            .filter(|r| r.is_active && r.user_id.map_or(true, |u| u == user_id))
            .cloned()
            .collect())
    }

    async fn income_records(&self, user_id: UserId) -> Result<Vec<IncomeRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.income.iter().filter(|r| r.user_id == user_id).cloned().collect())
    }

    async fn expense_records(&self, user_id: UserId) -> Result<Vec<ExpenseRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.expenses.iter().filter(|r| r.user_id == user_id).cloned().collect())
    }

    async fn insert_transactions(&self, txs: &[UnifiedTransaction]) -> Result<Vec<i64>, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_transaction_inserts {
            return Err(StoreError::Backend("transaction insert rejected".into()));
        }
        let mut ids = Vec::with_capacity(txs.len());
        for tx in txs {
            let id = state.allocate_id();
            let mut tx = tx.clone();
            tx.id = Some(id);
            state.transactions.push(tx);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn recurring_payments(&self, user_id: UserId) -> Result<Vec<RecurringPayment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .recurring
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn apply_recurring(
        &self,
        user_id: UserId,
        detection: &RecurringDetection,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        for payment in &detection.detected {
            let key = payment.key();
            if let Some(existing) = state
                .recurring
                .iter_mut()
                .find(|r| r.user_id == user_id && r.key() == key)
            {
                existing.absorb(payment);
                continue;
            }
            let mut payment = payment.clone();
            payment.id = Some(state.allocate_id());
            payment.user_id = user_id;
            state.recurring.push(payment);
        }
        for payment in &detection.updated {
            let slot = state.recurring.iter_mut().find(|r| {
                r.user_id == user_id
                    && match payment.id {
                        Some(id) => r.id == Some(id),
                        None => r.key() == payment.key(),
                    }
            });
            if let Some(slot) = slot {
                *slot = payment.clone();
            }
        }
        for (tx_id, pattern) in &detection.recurring_transactions {
            if let Some(tx) = state
                .transactions
                .iter_mut()
                .find(|t| t.user_id == user_id && t.id == Some(*tx_id))
            {
                tx.is_recurring = true;
                tx.recurrence_pattern = Some(*pattern);
            }
        }
        Ok(())
    }

    async fn update_account_balance(
        &self,
        user_id: UserId,
        account_id: AccountId,
        balance_cents: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_id)
            .filter(|a| a.user_id == user_id)
            .ok_or(StoreError::AccountNotFound(account_id))?;
        account.balance = Money::from_cents(balance_cents);
        Ok(())
    }

    async fn complete_import(
        &self,
        import_file_id: i64,
        counts: ImportCounts,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let file = state.processing_import(import_file_id)?;
        file.status = ImportStatus::Completed;
        file.counts = counts;
        file.processed_at = Some(now);
        Ok(())
    }

    async fn fail_import(
        &self,
        import_file_id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let file = state.processing_import(import_file_id)?;
        file.status = ImportStatus::Failed;
        file.error_message = Some(message.to_string());
        file.processed_at = Some(now);
        Ok(())
    }

    async fn get_import(&self, import_file_id: i64) -> Result<Option<ImportFile>, StoreError> {
        Ok(self.state.lock().await.imports.get(&import_file_id).cloned())
    }

    async fn list_imports(
        &self,
        user_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<ImportPage, StoreError> {
        let state = self.state.lock().await;
        let mut mine: Vec<&ImportFile> = state
            .imports
            .values()
            .filter(|f| f.user_id == user_id)
            .collect();
        mine.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(b.id.cmp(&a.id)));

        let page = page.max(1);
        let per_page = per_page.max(1);
        let items = mine
            .iter()
            .skip(usize::try_from(ImportPage::offset(page, per_page)).unwrap_or(usize::MAX))
            .take(per_page as usize)
            .map(|f| (*f).clone())
            .collect();
        Ok(ImportPage {
            items,
            total: u64::try_from(mine.len()).unwrap_or(u64::MAX),
            page,
            per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerline_core::{DuplicatePolicy, FileFormat};

    const USER: UserId = UserId(1);

    fn new_file(hash: &str, policy: DuplicatePolicy) -> NewImportFile {
        NewImportFile {
            user_id: USER,
            filename: "statement.csv".into(),
            format: FileFormat::Csv,
            byte_size: 10,
            content_hash: hash.into(),
            duplicate_policy: policy,
            account_id: None,
        }
    }

    async fn begin(store: &MemoryStore, hash: &str, policy: DuplicatePolicy, now: DateTime<Utc>) -> BeginImport {
        store
            .begin_import(new_file(hash, policy), now, Duration::seconds(600))
            .await
            .unwrap()
    }

    fn created_id(outcome: BeginImport) -> i64 {
        match outcome {
            BeginImport::Created(f) => f.id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_import_blocks_same_hash() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = created_id(begin(&store, "h", DuplicatePolicy::Reject, now).await);
        let counts = ImportCounts {
            total_rows: 3,
            imported: 3,
            duplicates: 0,
            errors: 0,
        };
        store.complete_import(id, counts, now).await.unwrap();

        match begin(&store, "h", DuplicatePolicy::Skip, now).await {
            BeginImport::AlreadyImported { existing_id } => assert_eq!(existing_id, id),
            other => panic!("unexpected {other:?}"),
        }
        // MARK_DUPLICATE may re-import; the earlier record is kept.
        let again = created_id(begin(&store, "h", DuplicatePolicy::MarkDuplicate, now).await);
        assert_ne!(again, id);
        assert!(store.get_import(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fresh_processing_blocks_stale_is_purged() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let first = created_id(begin(&store, "h", DuplicatePolicy::Reject, t0).await);

        match begin(&store, "h", DuplicatePolicy::Reject, t0 + Duration::seconds(5)).await {
            BeginImport::InProgress { existing_id } => assert_eq!(existing_id, first),
            other => panic!("unexpected {other:?}"),
        }

        let later = t0 + Duration::seconds(601);
        let second = created_id(begin(&store, "h", DuplicatePolicy::Reject, later).await);
        assert_ne!(first, second);
        assert!(store.get_import(first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_and_empty_attempts_are_purged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let failed = created_id(begin(&store, "h", DuplicatePolicy::Reject, now).await);
        store.fail_import(failed, "boom", now).await.unwrap();
        let empty = created_id(begin(&store, "h", DuplicatePolicy::Reject, now).await);
        assert!(store.get_import(failed).await.unwrap().is_none());
        store
            .complete_import(empty, ImportCounts::default(), now)
            .await
            .unwrap();
        created_id(begin(&store, "h", DuplicatePolicy::Reject, now).await);
        assert!(store.get_import(empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_states_never_transition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = created_id(begin(&store, "h", DuplicatePolicy::Reject, now).await);
        store.fail_import(id, "boom", now).await.unwrap();
        assert!(matches!(
            store.complete_import(id, ImportCounts::default(), now).await,
            Err(StoreError::NotProcessing(_))
        ));
        assert!(matches!(
            store.fail_import(999, "x", now).await,
            Err(StoreError::ImportNotFound(999))
        ));
    }

    #[tokio::test]
    async fn list_imports_newest_first_paginated() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for i in 0..5 {
            begin(&store, &format!("h{i}"), DuplicatePolicy::Reject, t0 + Duration::seconds(i)).await;
        }
        let page = store.list_imports(USER, 1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        let hashes: Vec<&str> = page.items.iter().map(|f| f.content_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h4", "h3"]);

        let last = store.list_imports(USER, 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].content_hash, "h0");

        assert_eq!(store.list_imports(UserId(2), 1, 10).await.unwrap().total, 0);

        let beyond = store.list_imports(USER, u32::MAX, 100).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);
        assert!(store.list_imports(USER, u32::MAX, u32::MAX).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn balance_update_requires_ownership() {
        let store = MemoryStore::new();
        let account = store.add_account(USER, "Everyday", 0).await;
        store.update_account_balance(USER, account, 12345).await.unwrap();
        assert_eq!(store.account(account).await.unwrap().balance, Money::from_cents(12345));
        assert!(matches!(
            store.update_account_balance(UserId(2), account, 1).await,
            Err(StoreError::AccountNotFound(_))
        ));
    }

    fn payment(merchant: &str, last: NaiveDate, count: u32) -> RecurringPayment {
        RecurringPayment {
            id: None,
            user_id: USER,
            merchant: merchant.to_string(),
            account_id: None,
            pattern: ledgerline_core::Frequency::Monthly,
            expected_amount_cents: 1599,
            amount_variance: 0.0,
            last_occurrence: last,
            next_occurrence: last + Duration::days(30),
            occurrence_count: count,
            confidence: 1.0,
            is_active: true,
            is_paused: false,
            price_increase_alert: false,
        }
    }

    #[tokio::test]
    async fn applying_same_detection_twice_keeps_one_row() {
        let store = MemoryStore::new();
        let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let detection = RecurringDetection {
            detected: vec![payment("NETFLIX.COM", jan, 6)],
            ..Default::default()
        };
        store.apply_recurring(USER, &detection).await.unwrap();
        store.apply_recurring(USER, &detection).await.unwrap();
        let registry = store.recurring_payments(USER).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].occurrence_count, 6);

        // A later run that also saw the key as new only advances the row.
        let feb = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
        let later = RecurringDetection {
            detected: vec![payment("NETFLIX.COM", feb, 7)],
            ..Default::default()
        };
        store.apply_recurring(USER, &later).await.unwrap();
        let registry = store.recurring_payments(USER).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].occurrence_count, 7);
        assert_eq!(registry[0].last_occurrence, feb);
    }
}
