use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ledgerline_core::{
    Account, AccountId, AnomalyFlag, Category, CategoryRule, EntityLink, ExpenseRecord,
    ImportCounts, ImportFile, ImportStatus, IncomeRecord, Money, NewImportFile, RawFields,
    RawTransactionRow, RecurringPayment, StoredTransaction, UnifiedTransaction, UserId,
};
use ledgerline_import::{
    BeginImport, ImportPage, ImportStore, RecurringDetection, StoreError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::debug;

use crate::db::DbPool;

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

/// Reads an INTEGER column that must fit the target type, e.g. a count.
fn column_int<T: TryFrom<i64>>(row: &SqliteRow, col: &str) -> Result<T, StoreError> {
    let n: i64 = row.try_get(col).map_err(db)?;
    T::try_from(n).map_err(|_| StoreError::Corrupt(format!("{col} out of range: {n}")))
}

fn sql_int<T: TryInto<i64> + Copy + std::fmt::Display>(value: T) -> Result<i64, StoreError> {
    value
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{value} does not fit an INTEGER column")))
}

fn link_from_columns(kind: Option<String>, id: Option<i64>) -> Result<Option<EntityLink>, StoreError> {
    match (kind, id) {
        (Some(kind), Some(id)) => EntityLink::from_parts(&kind, id)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("Unknown link type: '{kind}'"))),
        _ => Ok(None),
    }
}

const IMPORT_COLUMNS: &str = "id, user_id, filename, format, byte_size, content_hash, status, \
    total_rows, imported_count, duplicate_count, error_count, duplicate_policy, account_id, \
    error_message, uploaded_at, processed_at";

fn import_from_row(row: &SqliteRow) -> Result<ImportFile, StoreError> {
    let format: String = row.try_get("format").map_err(db)?;
    let status: String = row.try_get("status").map_err(db)?;
    let policy: String = row.try_get("duplicate_policy").map_err(db)?;
    Ok(ImportFile {
        id: row.try_get("id").map_err(db)?,
        user_id: UserId(row.try_get("user_id").map_err(db)?),
        filename: row.try_get("filename").map_err(db)?,
        format: parse(&format)?,
        byte_size: column_int(row, "byte_size")?,
        content_hash: row.try_get("content_hash").map_err(db)?,
        status: parse(&status)?,
        counts: ImportCounts {
            total_rows: column_int(row, "total_rows")?,
            imported: column_int(row, "imported_count")?,
            duplicates: column_int(row, "duplicate_count")?,
            errors: column_int(row, "error_count")?,
        },
        duplicate_policy: parse(&policy)?,
        account_id: row
            .try_get::<Option<i64>, _>("account_id")
            .map_err(db)?
            .map(AccountId),
        error_message: row.try_get("error_message").map_err(db)?,
        uploaded_at: row.try_get("uploaded_at").map_err(db)?,
        processed_at: row.try_get("processed_at").map_err(db)?,
    })
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredTransaction, StoreError> {
    let direction: String = row.try_get("direction").map_err(db)?;
    Ok(StoredTransaction {
        id: row.try_get("id").map_err(db)?,
        account_id: row
            .try_get::<Option<i64>, _>("account_id")
            .map_err(db)?
            .map(AccountId),
        date: row.try_get("date").map_err(db)?,
        amount_cents: row.try_get("amount_cents").map_err(db)?,
        direction: parse(&direction)?,
        description: row.try_get("description").map_err(db)?,
        merchant: row.try_get("merchant").map_err(db)?,
        fingerprint: row.try_get("fingerprint").map_err(db)?,
        is_recurring: row.try_get("is_recurring").map_err(db)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<UnifiedTransaction, StoreError> {
    let direction: String = row.try_get("direction").map_err(db)?;
    let source: String = row.try_get("source").map_err(db)?;
    let flags: String = row.try_get("anomaly_flags").map_err(db)?;
    let anomaly_flags: Vec<AnomalyFlag> =
        serde_json::from_str(&flags).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let pattern: Option<String> = row.try_get("recurrence_pattern").map_err(db)?;
    let origin: Option<String> = row.try_get("link_origin").map_err(db)?;

    Ok(UnifiedTransaction {
        id: Some(row.try_get("id").map_err(db)?),
        user_id: UserId(row.try_get("user_id").map_err(db)?),
        account_id: row
            .try_get::<Option<i64>, _>("account_id")
            .map_err(db)?
            .map(AccountId),
        date: row.try_get("date").map_err(db)?,
        amount_cents: row.try_get("amount_cents").map_err(db)?,
        direction: parse(&direction)?,
        description: row.try_get("description").map_err(db)?,
        merchant: row.try_get("merchant").map_err(db)?,
        fingerprint: row.try_get("fingerprint").map_err(db)?,
        mcc: row.try_get("mcc").map_err(db)?,
        bpay_biller_code: row.try_get("bpay_biller_code").map_err(db)?,
        reference: row.try_get("reference").map_err(db)?,
        category: Category {
            level1: row.try_get("category_level1").map_err(db)?,
            level2: row.try_get("category_level2").map_err(db)?,
            subcategory: row.try_get("subcategory").map_err(db)?,
        },
        confidence: row.try_get("confidence").map_err(db)?,
        rule_id: row.try_get("rule_id").map_err(db)?,
        is_recurring: row.try_get("is_recurring").map_err(db)?,
        recurrence_pattern: pattern.as_deref().map(parse).transpose()?,
        anomaly_flags,
        source: parse(&source)?,
        import_file_id: row.try_get("import_file_id").map_err(db)?,
        link: link_from_columns(
            row.try_get("link_type").map_err(db)?,
            row.try_get("link_id").map_err(db)?,
        )?,
        link_origin: origin.as_deref().map(parse).transpose()?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<CategoryRule, StoreError> {
    let rule_type: String = row.try_get("rule_type").map_err(db)?;
    Ok(CategoryRule {
        id: row.try_get("id").map_err(db)?,
        user_id: row
            .try_get::<Option<i64>, _>("user_id")
            .map_err(db)?
            .map(UserId),
        rule_type: parse(&rule_type)?,
        pattern: row.try_get("pattern").map_err(db)?,
        is_regex: row.try_get("is_regex").map_err(db)?,
        case_sensitive: row.try_get("case_sensitive").map_err(db)?,
        category: Category {
            level1: row.try_get("category_level1").map_err(db)?,
            level2: row.try_get("category_level2").map_err(db)?,
            subcategory: row.try_get("subcategory").map_err(db)?,
        },
        link: link_from_columns(
            row.try_get("link_type").map_err(db)?,
            row.try_get("link_id").map_err(db)?,
        )?,
        priority: row.try_get("priority").map_err(db)?,
        is_active: row.try_get("is_active").map_err(db)?,
    })
}

fn recurring_from_row(row: &SqliteRow) -> Result<RecurringPayment, StoreError> {
    let pattern: String = row.try_get("pattern").map_err(db)?;
    Ok(RecurringPayment {
        id: Some(row.try_get("id").map_err(db)?),
        user_id: UserId(row.try_get("user_id").map_err(db)?),
        merchant: row.try_get("merchant").map_err(db)?,
        account_id: row
            .try_get::<Option<i64>, _>("account_id")
            .map_err(db)?
            .map(AccountId),
        pattern: parse(&pattern)?,
        expected_amount_cents: row.try_get("expected_amount_cents").map_err(db)?,
        amount_variance: row.try_get("amount_variance").map_err(db)?,
        last_occurrence: row.try_get("last_occurrence").map_err(db)?,
        next_occurrence: row.try_get("next_occurrence").map_err(db)?,
        occurrence_count: column_int(row, "occurrence_count")?,
        confidence: row.try_get("confidence").map_err(db)?,
        is_active: row.try_get("is_active").map_err(db)?,
        is_paused: row.try_get("is_paused").map_err(db)?,
        price_increase_alert: row.try_get("price_increase_alert").map_err(db)?,
    })
}

/// [`ImportStore`] backed by the SQLite pool from [`crate::create_db`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn add_account(
        &self,
        user_id: UserId,
        name: &str,
        balance_cents: i64,
    ) -> Result<AccountId, StoreError> {
        let result = sqlx::query("INSERT INTO accounts (user_id, name, balance_cents) VALUES (?, ?, ?)")
            .bind(user_id.0)
            .bind(name)
            .bind(balance_cents)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(AccountId(result.last_insert_rowid()))
    }

    pub async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query_as::<_, (i64, i64, String, i64)>(
            "SELECT id, user_id, name, balance_cents FROM accounts WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        Ok(row.map(|r| Account {
            id: AccountId(r.0),
            user_id: UserId(r.1),
            name: r.2,
            balance: Money::from_cents(r.3),
        }))
    }

    pub async fn add_rule(&self, rule: &CategoryRule) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO category_rules (user_id, rule_type, pattern, is_regex, case_sensitive,
                category_level1, category_level2, subcategory, link_type, link_id, priority, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.user_id.map(|u| u.0))
        .bind(rule.rule_type.as_str())
        .bind(&rule.pattern)
        .bind(rule.is_regex)
        .bind(rule.case_sensitive)
        .bind(&rule.category.level1)
        .bind(&rule.category.level2)
        .bind(&rule.category.subcategory)
        .bind(rule.link.map(|l| l.kind()))
        .bind(rule.link.map(|l| l.id()))
        .bind(rule.priority)
        .bind(rule.is_active)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_income(&self, record: &IncomeRecord) -> Result<i64, StoreError> {
        self.add_record("income_records", record.user_id, &record.name, record.amount_cents, record.frequency.as_str())
            .await
    }

    pub async fn add_expense(&self, record: &ExpenseRecord) -> Result<i64, StoreError> {
        self.add_record("expense_records", record.user_id, &record.name, record.amount_cents, record.frequency.as_str())
            .await
    }

    async fn add_record(
        &self,
        table: &str,
        user_id: UserId,
        name: &str,
        amount_cents: i64,
        frequency: &str,
    ) -> Result<i64, StoreError> {
        let sql = format!("INSERT INTO {table} (user_id, name, amount_cents, frequency) VALUES (?, ?, ?, ?)");
        let result = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(name)
            .bind(amount_cents)
            .bind(frequency)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.last_insert_rowid())
    }

    async fn records(
        &self,
        table: &str,
        user_id: UserId,
    ) -> Result<Vec<(i64, String, i64, String)>, StoreError> {
        let sql = format!("SELECT id, name, amount_cents, frequency FROM {table} WHERE user_id = ? ORDER BY id");
        sqlx::query_as::<_, (i64, String, i64, String)>(&sql)
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db)
    }

    /// Every transaction of a user in insertion order.
    pub async fn transactions(&self, user_id: UserId) -> Result<Vec<UnifiedTransaction>, StoreError> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE user_id = ? ORDER BY id")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn raw_rows(&self, import_file_id: i64) -> Result<Vec<RawTransactionRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT import_file_id, row_number, raw_date, raw_description, raw_amount, raw_direction,
                raw_balance, raw_reference, row_hash, fingerprint, processed
            FROM raw_transaction_rows WHERE import_file_id = ? ORDER BY row_number
            "#,
        )
        .bind(import_file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(RawTransactionRow {
                    import_file_id: row.try_get("import_file_id").map_err(db)?,
                    row_number: column_int(row, "row_number")?,
                    fields: RawFields {
                        date: row.try_get("raw_date").map_err(db)?,
                        description: row.try_get("raw_description").map_err(db)?,
                        amount: row.try_get("raw_amount").map_err(db)?,
                        direction: row.try_get("raw_direction").map_err(db)?,
                        balance: row.try_get("raw_balance").map_err(db)?,
                        reference: row.try_get("raw_reference").map_err(db)?,
                    },
                    row_hash: row.try_get("row_hash").map_err(db)?,
                    fingerprint: row.try_get("fingerprint").map_err(db)?,
                    processed: row.try_get("processed").map_err(db)?,
                })
            })
            .collect()
    }

    async fn imports_for_hash(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
        content_hash: &str,
    ) -> Result<Vec<ImportFile>, StoreError> {
        let sql = format!(
            "SELECT {IMPORT_COLUMNS} FROM import_files WHERE user_id = ? AND content_hash = ? ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(content_hash)
            .fetch_all(&mut **tx)
            .await
            .map_err(db)?;
        rows.iter().map(import_from_row).collect()
    }

    async fn set_terminal(
        &self,
        import_file_id: i64,
        status: ImportStatus,
        counts: Option<ImportCounts>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let counts = counts.unwrap_or_default();
        let result = sqlx::query(
            r#"
            UPDATE import_files
            SET status = ?, total_rows = ?, imported_count = ?, duplicate_count = ?,
                error_count = ?, error_message = ?, processed_at = ?
            WHERE id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(status.as_str())
        .bind(sql_int(counts.total_rows)?)
        .bind(sql_int(counts.imported)?)
        .bind(sql_int(counts.duplicates)?)
        .bind(sql_int(counts.errors)?)
        .bind(message)
        .bind(now)
        .bind(import_file_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(match self.get_import(import_file_id).await? {
                Some(_) => StoreError::NotProcessing(import_file_id),
                None => StoreError::ImportNotFound(import_file_id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImportStore for SqliteStore {
    async fn begin_import(
        &self,
        new: NewImportFile,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<BeginImport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let same = Self::imports_for_hash(&mut tx, new.user_id, &new.content_hash).await?;

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

        for stale in same.iter().filter(|f| f.is_purgeable(now, stale_after)) {
            debug!(import_file_id = stale.id, status = %stale.status, "purging earlier import attempt");
            sqlx::query("DELETE FROM import_files WHERE id = ?")
                .bind(stale.id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO import_files (user_id, filename, format, byte_size, content_hash, status,
                duplicate_policy, account_id, uploaded_at)
            VALUES (?, ?, ?, ?, ?, 'PROCESSING', ?, ?, ?)
            "#,
        )
        .bind(new.user_id.0)
        .bind(&new.filename)
        .bind(new.format.as_str())
        .bind(sql_int(new.byte_size)?)
        .bind(&new.content_hash)
        .bind(new.duplicate_policy.as_str())
        .bind(new.account_id.map(|a| a.0))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        Ok(BeginImport::Created(ImportFile {
            id: result.last_insert_rowid(),
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
        }))
    }

    async fn insert_raw_rows(&self, rows: &[RawTransactionRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO raw_transaction_rows (import_file_id, row_number, raw_date, raw_description,
                    raw_amount, raw_direction, raw_balance, raw_reference, row_hash, fingerprint, processed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.import_file_id)
            .bind(sql_int(row.row_number)?)
            .bind(&row.fields.date)
            .bind(&row.fields.description)
            .bind(&row.fields.amount)
            .bind(&row.fields.direction)
            .bind(&row.fields.balance)
            .bind(&row.fields.reference)
            .bind(&row.row_hash)
            .bind(&row.fingerprint)
            .bind(row.processed)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)
    }

    async fn mark_raw_rows_processed(&self, import_file_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE raw_transaction_rows SET processed = 1 WHERE import_file_id = ?")
            .bind(import_file_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn existing_transactions(&self, user_id: UserId) -> Result<Vec<StoredTransaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, date, amount_cents, direction, description, merchant,
                fingerprint, is_recurring
            FROM transactions WHERE user_id = ? ORDER BY id
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<StoredTransaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, date, amount_cents, direction, description, merchant,
                fingerprint, is_recurring
            FROM transactions WHERE user_id = ? AND date >= ? ORDER BY date, id
            "#,
        )
        .bind(user_id.0)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn load_active_rules(&self, user_id: UserId) -> Result<Vec<CategoryRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM category_rules
            WHERE is_active = 1 AND (user_id IS NULL OR user_id = ?)
            ORDER BY priority DESC, id
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn income_records(&self, user_id: UserId) -> Result<Vec<IncomeRecord>, StoreError> {
        self.records("income_records", user_id)
            .await?
            .into_iter()
            .map(|(id, name, amount_cents, frequency)| {
                Ok(IncomeRecord {
                    id,
                    user_id,
                    name,
                    amount_cents,
                    frequency: parse(&frequency)?,
                })
            })
            .collect()
    }

    async fn expense_records(&self, user_id: UserId) -> Result<Vec<ExpenseRecord>, StoreError> {
        self.records("expense_records", user_id)
            .await?
            .into_iter()
            .map(|(id, name, amount_cents, frequency)| {
                Ok(ExpenseRecord {
                    id,
                    user_id,
                    name,
                    amount_cents,
                    frequency: parse(&frequency)?,
                })
            })
            .collect()
    }

    async fn insert_transactions(&self, txs: &[UnifiedTransaction]) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let mut ids = Vec::with_capacity(txs.len());
        for t in txs {
            let flags = serde_json::to_string(&t.anomaly_flags)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let result = sqlx::query(
                r#"
                INSERT INTO transactions (user_id, account_id, date, amount_cents, direction,
                    description, merchant, fingerprint, mcc, bpay_biller_code, reference,
                    category_level1, category_level2, subcategory, confidence, rule_id,
                    is_recurring, recurrence_pattern, anomaly_flags, source, import_file_id,
                    link_type, link_id, link_origin)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(t.user_id.0)
            .bind(t.account_id.map(|a| a.0))
            .bind(t.date)
            .bind(t.amount_cents)
            .bind(t.direction.as_str())
            .bind(&t.description)
            .bind(&t.merchant)
            .bind(&t.fingerprint)
            .bind(&t.mcc)
            .bind(&t.bpay_biller_code)
            .bind(&t.reference)
            .bind(&t.category.level1)
            .bind(&t.category.level2)
            .bind(&t.category.subcategory)
            .bind(t.confidence)
            .bind(t.rule_id)
            .bind(t.is_recurring)
            .bind(t.recurrence_pattern.map(|p| p.as_str()))
            .bind(flags)
            .bind(t.source.as_str())
            .bind(t.import_file_id)
            .bind(t.link.map(|l| l.kind()))
            .bind(t.link.map(|l| l.id()))
            .bind(t.link_origin.map(|o| o.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await.map_err(db)?;
        Ok(ids)
    }

    async fn recurring_payments(&self, user_id: UserId) -> Result<Vec<RecurringPayment>, StoreError> {
        let rows = sqlx::query("SELECT * FROM recurring_payments WHERE user_id = ? ORDER BY id")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(recurring_from_row).collect()
    }

    async fn apply_recurring(
        &self,
        user_id: UserId,
        detection: &RecurringDetection,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        for p in &detection.detected {
            sqlx::query(
                r#"
                INSERT INTO recurring_payments (user_id, merchant, account_id, pattern,
                    expected_amount_cents, amount_variance, last_occurrence, next_occurrence,
                    occurrence_count, confidence, is_active, is_paused, price_increase_alert)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO UPDATE SET
                    pattern = excluded.pattern,
                    expected_amount_cents = excluded.expected_amount_cents,
                    amount_variance = excluded.amount_variance,
                    last_occurrence = excluded.last_occurrence,
                    next_occurrence = excluded.next_occurrence,
                    occurrence_count = excluded.occurrence_count,
                    confidence = excluded.confidence,
                    is_active = excluded.is_active,
                    price_increase_alert = price_increase_alert OR excluded.price_increase_alert
                WHERE recurring_payments.is_paused = 0
                  AND excluded.last_occurrence > recurring_payments.last_occurrence
                "#,
            )
            .bind(user_id.0)
            .bind(&p.merchant)
            .bind(p.account_id.map(|a| a.0))
            .bind(p.pattern.as_str())
            .bind(p.expected_amount_cents)
            .bind(p.amount_variance)
            .bind(p.last_occurrence)
            .bind(p.next_occurrence)
            .bind(i64::from(p.occurrence_count))
            .bind(p.confidence)
            .bind(p.is_active)
            .bind(p.is_paused)
            .bind(p.price_increase_alert)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        for p in &detection.updated {
            let Some(id) = p.id else {
                return Err(StoreError::Corrupt(format!(
                    "recurring update for '{}' has no id",
                    p.merchant
                )));
            };
            sqlx::query(
                r#"
                UPDATE recurring_payments
                SET pattern = ?, expected_amount_cents = ?, amount_variance = ?, last_occurrence = ?,
                    next_occurrence = ?, occurrence_count = ?, confidence = ?, is_active = ?,
                    price_increase_alert = ?
                WHERE id = ? AND user_id = ?
                "#,
            )
            .bind(p.pattern.as_str())
            .bind(p.expected_amount_cents)
            .bind(p.amount_variance)
            .bind(p.last_occurrence)
            .bind(p.next_occurrence)
            .bind(i64::from(p.occurrence_count))
            .bind(p.confidence)
            .bind(p.is_active)
            .bind(p.price_increase_alert)
            .bind(id)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        for (tx_id, pattern) in &detection.recurring_transactions {
            sqlx::query(
                "UPDATE transactions SET is_recurring = 1, recurrence_pattern = ? WHERE id = ? AND user_id = ?",
            )
            .bind(pattern.as_str())
            .bind(*tx_id)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)
    }

    async fn update_account_balance(
        &self,
        user_id: UserId,
        account_id: AccountId,
        balance_cents: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE accounts SET balance_cents = ? WHERE id = ? AND user_id = ?")
            .bind(balance_cents)
            .bind(account_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(account_id));
        }
        Ok(())
    }

    async fn complete_import(
        &self,
        import_file_id: i64,
        counts: ImportCounts,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.set_terminal(import_file_id, ImportStatus::Completed, Some(counts), None, now)
            .await
    }

    async fn fail_import(
        &self,
        import_file_id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.set_terminal(import_file_id, ImportStatus::Failed, None, Some(message), now)
            .await
    }

    async fn get_import(&self, import_file_id: i64) -> Result<Option<ImportFile>, StoreError> {
        let sql = format!("SELECT {IMPORT_COLUMNS} FROM import_files WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(import_file_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(import_from_row).transpose()
    }

    async fn list_imports(
        &self,
        user_id: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<ImportPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.max(1);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_files WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;

        let sql = format!(
            "SELECT {IMPORT_COLUMNS} FROM import_files WHERE user_id = ? \
             ORDER BY uploaded_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.0)
            .bind(i64::from(per_page))
            .bind(i64::try_from(ImportPage::offset(page, per_page)).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let items = rows.iter().map(import_from_row).collect::<Result<_, _>>()?;

        Ok(ImportPage {
            items,
            total: u64::try_from(total).unwrap_or_default(),
            page,
            per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_db;
    use ledgerline_core::{
        Direction, DuplicatePolicy, FileFormat, Frequency, LinkOrigin, RuleType, TransactionSource,
    };
    use ledgerline_import::{ImportPipeline, ImportRequest, PipelineConfig, PipelineError};
    use std::sync::Arc;
    use tempfile::TempDir;

    const USER: UserId = UserId(1);

    async fn store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("test.db")).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn new_file(hash: &str, policy: DuplicatePolicy) -> NewImportFile {
        NewImportFile {
            user_id: USER,
            filename: "statement.csv".into(),
            format: FileFormat::Csv,
            byte_size: 42,
            content_hash: hash.into(),
            duplicate_policy: policy,
            account_id: None,
        }
    }

    fn created(result: BeginImport) -> ImportFile {
        match result {
            BeginImport::Created(file) => file,
            other => panic!("expected a new import, got {other:?}"),
        }
    }

    fn unified(date: NaiveDate, merchant: &str, cents: i64) -> UnifiedTransaction {
        UnifiedTransaction {
            id: None,
            user_id: USER,
            account_id: Some(AccountId(7)),
            date,
            amount_cents: cents,
            direction: Direction::Out,
            description: merchant.into(),
            merchant: merchant.into(),
            fingerprint: format!("{date}-{merchant}"),
            mcc: Some("5411".into()),
            bpay_biller_code: None,
            reference: None,
            category: Category::new("FOOD", Some("GROCERIES")),
            confidence: 1.0,
            rule_id: Some(3),
            is_recurring: false,
            recurrence_pattern: None,
            anomaly_flags: vec![AnomalyFlag::PossibleDuplicate],
            source: TransactionSource::Csv,
            import_file_id: Some(1),
            link: Some(EntityLink::Expense(4)),
            link_origin: Some(LinkOrigin::Rule),
        }
    }

    #[tokio::test]
    async fn import_lifecycle_and_hash_check() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let stale = Duration::seconds(600);

        let file = created(store.begin_import(new_file("h1", DuplicatePolicy::Reject), now, stale).await.unwrap());
        assert_eq!(file.status, ImportStatus::Processing);

        match store.begin_import(new_file("h1", DuplicatePolicy::Reject), now, stale).await.unwrap() {
            BeginImport::InProgress { existing_id } => assert_eq!(existing_id, file.id),
            other => panic!("unexpected {other:?}"),
        }

        let counts = ImportCounts { total_rows: 3, imported: 2, duplicates: 1, errors: 0 };
        store.complete_import(file.id, counts, now).await.unwrap();
        let stored = store.get_import(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ImportStatus::Completed);
        assert_eq!(stored.counts, counts);

        match store.begin_import(new_file("h1", DuplicatePolicy::Skip), now, stale).await.unwrap() {
            BeginImport::AlreadyImported { existing_id } => assert_eq!(existing_id, file.id),
            other => panic!("unexpected {other:?}"),
        }
        created(store.begin_import(new_file("h1", DuplicatePolicy::MarkDuplicate), now, stale).await.unwrap());

        assert!(matches!(
            store.fail_import(file.id, "late", now).await,
            Err(StoreError::NotProcessing(_))
        ));
        assert!(matches!(
            store.complete_import(999, counts, now).await,
            Err(StoreError::ImportNotFound(999))
        ));
    }

    #[tokio::test]
    async fn failed_and_stale_attempts_are_purged() {
        let (_dir, store) = store().await;
        let start = Utc::now();
        let stale = Duration::seconds(600);

        let failed = created(store.begin_import(new_file("h", DuplicatePolicy::Reject), start, stale).await.unwrap());
        store.fail_import(failed.id, "boom", start).await.unwrap();

        let stuck = created(store.begin_import(new_file("h", DuplicatePolicy::Reject), start, stale).await.unwrap());
        assert!(store.get_import(failed.id).await.unwrap().is_none());

        let later = start + Duration::seconds(601);
        let fresh = created(store.begin_import(new_file("h", DuplicatePolicy::Reject), later, stale).await.unwrap());
        assert!(store.get_import(stuck.id).await.unwrap().is_none());
        assert_ne!(fresh.id, stuck.id);
    }

    #[tokio::test]
    async fn transactions_round_trip() {
        let (_dir, store) = store().await;
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let ids = store
            .insert_transactions(&[unified(date, "COLES", 4500), unified(date, "ALDI", 1200)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let txs = store.transactions(USER).await.unwrap();
        assert_eq!(txs[0].id, Some(ids[0]));
        let mut expected = unified(date, "COLES", 4500);
        expected.id = Some(ids[0]);
        assert_eq!(txs[0], expected);

        let since = store
            .transactions_since(USER, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
            .await
            .unwrap();
        assert!(since.is_empty());
        assert!(store.existing_transactions(UserId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rules_are_scoped_to_user_and_active() {
        let (_dir, store) = store().await;
        let rule = |user_id, pattern: &str, is_active| CategoryRule {
            id: 0,
            user_id,
            rule_type: RuleType::Keyword,
            pattern: pattern.into(),
            is_regex: false,
            case_sensitive: false,
            category: Category::new("SHOPPING", None),
            link: None,
            priority: 1,
            is_active,
        };
        store.add_rule(&rule(Some(USER), "mine", true)).await.unwrap();
        store.add_rule(&rule(None, "global", true)).await.unwrap();
        store.add_rule(&rule(Some(UserId(2)), "theirs", true)).await.unwrap();
        store.add_rule(&rule(Some(USER), "off", false)).await.unwrap();

        let mut patterns: Vec<String> = store
            .load_active_rules(USER)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.pattern)
            .collect();
        patterns.sort();
        assert_eq!(patterns, vec!["global", "mine"]);
    }

    #[tokio::test]
    async fn pagination_is_newest_first() {
        let (_dir, store) = store().await;
        let start = Utc::now();
        for i in 0..5 {
            let file = created(
                store
                    .begin_import(
                        new_file(&format!("h{i}"), DuplicatePolicy::Reject),
                        start + Duration::seconds(i),
                        Duration::seconds(600),
                    )
                    .await
                    .unwrap(),
            );
            store.fail_import(file.id, "x", start).await.unwrap();
        }
        let page = store.list_imports(USER, 2, 2).await.unwrap();
        assert_eq!(page.total, 5);
        let hashes: Vec<&str> = page.items.iter().map(|f| f.content_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h2", "h1"]);

        let beyond = store.list_imports(USER, u32::MAX, u32::MAX).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);
    }

    #[tokio::test]
    async fn pipeline_runs_against_sqlite() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let account = store.add_account(USER, "Everyday", 0).await.unwrap();
        store
            .add_expense(&ExpenseRecord {
                id: 0,
                user_id: USER,
                name: "Netflix".into(),
                amount_cents: 1599,
                frequency: Frequency::Monthly,
            })
            .await
            .unwrap();

        let mut csv = String::from("Date,Description,Amount,Balance\n");
        for m in 1..=6 {
            csv.push_str(&format!("2024-{m:02}-15,NETFLIX.COM,-15.99,{}.00\n", 1000 - m));
        }
        let pipeline = ImportPipeline::new(store.clone(), PipelineConfig::default());
        let mut req = ImportRequest::new(USER, "netflix.csv", csv.clone().into_bytes());
        req.account_id = Some(account);
        req.update_balance = true;

        let summary = pipeline.import(req.clone()).await.unwrap();
        assert_eq!(summary.imported, 6);
        assert_eq!(summary.auto_linked, 6);
        assert!(summary.closing_balance_applied);

        let registry = store.recurring_payments(USER).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].pattern, Frequency::Monthly);
        assert!(store.transactions(USER).await.unwrap().iter().all(|t| t.is_recurring));
        assert_eq!(
            store.account(account).await.unwrap().unwrap().balance,
            Money::from_cents(99400)
        );
        assert!(store.raw_rows(summary.import_file_id).await.unwrap().iter().all(|r| r.processed));

        assert!(matches!(
            pipeline.import(req).await,
            Err(PipelineError::Conflict { .. })
        ));
    }

    fn netflix(account_id: Option<AccountId>, last: NaiveDate, count: u32) -> RecurringPayment {
        RecurringPayment {
            id: None,
            user_id: USER,
            merchant: "NETFLIX.COM".to_string(),
            account_id,
            pattern: Frequency::Monthly,
            expected_amount_cents: 1599,
            amount_variance: 0.0,
            last_occurrence: last,
            next_occurrence: Frequency::Monthly.advance(last),
            occurrence_count: count,
            confidence: 1.0,
            is_active: true,
            is_paused: false,
            price_increase_alert: false,
        }
    }

    #[tokio::test]
    async fn registry_key_is_unique_across_runs() {
        let (_dir, store) = store().await;
        let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let detection = RecurringDetection {
            detected: vec![netflix(None, jan, 6), netflix(Some(AccountId(7)), jan, 6)],
            ..Default::default()
        };
        store.apply_recurring(USER, &detection).await.unwrap();
        store.apply_recurring(USER, &detection).await.unwrap();
        let registry = store.recurring_payments(USER).await.unwrap();
        assert_eq!(registry.len(), 2);

        let feb = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
        let later = RecurringDetection {
            detected: vec![netflix(None, feb, 7)],
            ..Default::default()
        };
        store.apply_recurring(USER, &later).await.unwrap();
        let registry = store.recurring_payments(USER).await.unwrap();
        assert_eq!(registry.len(), 2);
        let unscoped = registry.iter().find(|p| p.account_id.is_none()).unwrap();
        assert_eq!(unscoped.occurrence_count, 7);
        assert_eq!(unscoped.last_occurrence, feb);

        // Paused rows keep their values.
        sqlx::query("UPDATE recurring_payments SET is_paused = 1 WHERE account_id = 7")
            .execute(&store.pool)
            .await
            .unwrap();
        let later = RecurringDetection {
            detected: vec![netflix(Some(AccountId(7)), feb, 7)],
            ..Default::default()
        };
        store.apply_recurring(USER, &later).await.unwrap();
        let registry = store.recurring_payments(USER).await.unwrap();
        let paused = registry.iter().find(|p| p.account_id == Some(AccountId(7))).unwrap();
        assert_eq!(paused.occurrence_count, 6);
    }

    #[tokio::test]
    async fn counts_round_trip_beyond_u32_and_reject_negatives() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let file = created(
            store
                .begin_import(new_file("big", DuplicatePolicy::Reject), now, Duration::seconds(600))
                .await
                .unwrap(),
        );
        let counts = ImportCounts { total_rows: 5_000_000_000, imported: 4_294_967_296, duplicates: 0, errors: 0 };
        store.complete_import(file.id, counts, now).await.unwrap();
        assert_eq!(store.get_import(file.id).await.unwrap().unwrap().counts, counts);

        sqlx::query("UPDATE import_files SET error_count = -1 WHERE id = ?")
            .bind(file.id)
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(store.get_import(file.id).await, Err(StoreError::Corrupt(_))));
    }
}
