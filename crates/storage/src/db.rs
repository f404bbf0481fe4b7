use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

/// Opens (creating if needed) the database at `path` and brings the schema up to date.
pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    // A single connection serializes writers, which the import hash check relies on.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -32000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            balance_cents INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            filename TEXT NOT NULL,
            format TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            total_rows INTEGER NOT NULL DEFAULT 0,
            imported_count INTEGER NOT NULL DEFAULT 0,
            duplicate_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            duplicate_policy TEXT NOT NULL,
            account_id INTEGER,
            error_message TEXT,
            uploaded_at TEXT NOT NULL,
            processed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_files_hash ON import_files (user_id, content_hash)",
    )
    .execute(pool)
    .await?;

    // No foreign key: raw rows outlive purged import attempts as an audit trail.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_transaction_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            import_file_id INTEGER NOT NULL,
            row_number INTEGER NOT NULL,
            raw_date TEXT,
            raw_description TEXT,
            raw_amount TEXT,
            raw_direction TEXT,
            raw_balance TEXT,
            raw_reference TEXT,
            row_hash TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_rows_import ON raw_transaction_rows (import_file_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            account_id INTEGER,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            direction TEXT NOT NULL,
            description TEXT NOT NULL,
            merchant TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            mcc TEXT,
            bpay_biller_code TEXT,
            reference TEXT,
            category_level1 TEXT NOT NULL,
            category_level2 TEXT,
            subcategory TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            rule_id INTEGER,
            is_recurring INTEGER NOT NULL DEFAULT 0,
            recurrence_pattern TEXT,
            anomaly_flags TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL,
            import_file_id INTEGER,
            link_type TEXT,
            link_id INTEGER,
            link_origin TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions (user_id, date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS category_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            rule_type TEXT NOT NULL,
            pattern TEXT NOT NULL,
            is_regex INTEGER NOT NULL DEFAULT 0,
            case_sensitive INTEGER NOT NULL DEFAULT 0,
            category_level1 TEXT NOT NULL,
            category_level2 TEXT,
            subcategory TEXT,
            link_type TEXT,
            link_id INTEGER,
            priority INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recurring_payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            merchant TEXT NOT NULL,
            account_id INTEGER,
            pattern TEXT NOT NULL,
            expected_amount_cents INTEGER NOT NULL,
            amount_variance REAL NOT NULL DEFAULT 0,
            last_occurrence TEXT NOT NULL,
            next_occurrence TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL,
            confidence REAL NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_paused INTEGER NOT NULL DEFAULT 0,
            price_increase_alert INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One registry row per (user, merchant, account); a missing account is its own key.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_recurring_key \
         ON recurring_payments (user_id, merchant, IFNULL(account_id, -1))",
    )
    .execute(pool)
    .await?;

    for table in ["income_records", "expense_records"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                frequency TEXT NOT NULL
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}
