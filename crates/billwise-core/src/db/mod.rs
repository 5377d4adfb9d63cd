//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `transactions` - Normalized transactions per account
//! - `subscriptions` - Subscriptions and their contributing charges
//! - `merchants` - Merchant keys and usage counts
//!
//! `Database` implements [`LedgerStore`]: a whole account state is written in
//! one SQLite transaction, so a crash never leaves half an ingest behind.

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ledger::{AccountState, LedgerStore};

mod merchants;
mod subscriptions;
mod transactions;

#[cfg(test)]
mod tests;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Parse a stored timestamp (RFC 3339, or SQLite's "YYYY-MM-DD HH:MM:SS")
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_stored_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::InvalidData(format!("invalid stored date '{}'", s)))
}

pub(crate) fn parse_stored_amount(s: &str) -> Result<Decimal> {
    s.parse()
        .map_err(|_| Error::InvalidData(format!("invalid stored amount '{}'", s)))
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` so every pooled
    /// connection sees the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir()
            .join(format!("billwise_test_{}_{}.db", std::process::id(), id))
            .to_string_lossy()
            .into_owned();

        // Remove any existing file
        let _ = std::fs::remove_file(&path);

        Self::new(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Committed version per account
            CREATE TABLE IF NOT EXISTS account_versions (
                account TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Normalized transactions; amounts are decimal text, dates YYYY-MM-DD
            CREATE TABLE IF NOT EXISTS transactions (
                account TEXT NOT NULL REFERENCES account_versions(account),
                id TEXT NOT NULL,
                bank_account TEXT NOT NULL,
                date DATE NOT NULL,
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                merchant_key TEXT NOT NULL,
                reference TEXT,
                source_row INTEGER NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account, id)
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_group
                ON transactions(account, bank_account, merchant_key, date);

            -- Detected subscriptions; ids are global across accounts
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY,
                account TEXT NOT NULL REFERENCES account_versions(account),
                name TEXT NOT NULL,
                merchant_key TEXT NOT NULL,
                bank_account TEXT NOT NULL,
                amount TEXT NOT NULL,
                frequency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                first_seen DATE NOT NULL,
                last_seen DATE NOT NULL,
                next_renewal DATE NOT NULL,
                cancellation_probability REAL,
                weak_signal INTEGER NOT NULL DEFAULT 0,
                cancelled_on DATE,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscriptions_account ON subscriptions(account);

            -- Subscription id reservations; AUTOINCREMENT never hands out an
            -- id twice, even to separate handles on the same file
            CREATE TABLE IF NOT EXISTS subscription_ids (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                reserved_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Backfill ids saved before reservations existed
            INSERT INTO subscription_ids (id, account)
                SELECT id, account FROM subscriptions
                WHERE id > (SELECT COALESCE(MAX(id), 0) FROM subscription_ids);

            -- Contributing charges, in chronological position
            CREATE TABLE IF NOT EXISTS subscription_transactions (
                subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                account TEXT NOT NULL,
                transaction_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (subscription_id, transaction_id),
                FOREIGN KEY (account, transaction_id) REFERENCES transactions(account, id)
            );

            -- Merchant registry
            CREATE TABLE IF NOT EXISTS merchant_keys (
                account TEXT NOT NULL REFERENCES account_versions(account),
                bank_account TEXT NOT NULL,
                merchant_key TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account, bank_account, merchant_key)
            );
            "#,
        )?;

        debug!("Database migrations applied to {}", self.db_path);
        Ok(())
    }

    /// Committed version of an account (None if never saved)
    pub fn account_version(&self, account: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM account_versions WHERE account = ?",
                params![account],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    /// Accounts that have at least one committed mutation
    pub fn list_accounts(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT account FROM account_versions ORDER BY account")?;
        let accounts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(accounts)
    }
}

impl LedgerStore for Database {
    fn load_account(&self, account: &str) -> Result<Option<AccountState>> {
        let Some(version) = self.account_version(account)? else {
            return Ok(None);
        };

        let conn = self.conn()?;
        let mut state = AccountState::new(account);
        state.version = version;
        for tx in transactions::load_transactions(&conn, account)? {
            state.transactions.insert(tx.id.clone(), tx);
        }
        state.registry = merchants::load_registry(&conn, account)?;
        state.subscriptions = subscriptions::load_subscriptions(&conn, account)?;

        Ok(Some(state))
    }

    fn save_account(&self, state: &AccountState) -> Result<()> {
        let mut conn = self.conn()?;
        // Take the write lock up front so the version check below cannot go
        // stale before the writes land
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM account_versions WHERE account = ?",
                params![state.account],
                |row| row.get(0),
            )
            .optional()?;
        if stored.is_some_and(|v| v as u64 >= state.version) {
            return Err(Error::ConcurrentMutationConflict(state.account.clone()));
        }

        tx.execute(
            r#"
            INSERT INTO account_versions (account, version, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(account) DO UPDATE SET
                version = excluded.version,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![state.account, state.version as i64],
        )?;

        let added = transactions::save_transactions(&tx, &state.account, state.transactions.values())?;
        merchants::save_registry(&tx, &state.account, &state.registry)?;
        subscriptions::save_subscriptions(&tx, &state.account, &state.subscriptions)?;

        tx.commit()?;
        info!(
            "Saved account '{}' at version {} ({} new transactions)",
            state.account, state.version, added
        );
        Ok(())
    }

    fn allocate_subscription_id(&self, account: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subscription_ids (account) VALUES (?)",
            params![account],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Reserved subscription id {} for '{}'", id, account);
        Ok(id)
    }
}
