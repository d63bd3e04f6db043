// =============================================================================
// Database — rusqlite connection wrapper with WAL mode and schema bootstrap
// =============================================================================
//
// One connection, guarded by a `parking_lot::Mutex`, shared via `Arc` by every
// component. Each operation locks, runs, and releases; transactions are scoped
// closures so a failed step rolls back the whole mutation.
//
// Monetary values persist as TEXT (decimal string), timestamps as RFC 3339
// TEXT, trading days as `YYYY-MM-DD` TEXT.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use rust_decimal::Decimal;
use tracing::info;

use crate::errors::CoreError;

/// Schema applied on startup. `IF NOT EXISTS` everywhere so reopening an
/// existing database is a no-op.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS portfolios (
    portfolio_id TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    name         TEXT NOT NULL,
    currency     TEXT NOT NULL,
    created_at   TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ledger_events (
    event_id     TEXT PRIMARY KEY,
    portfolio_id TEXT NOT NULL REFERENCES portfolios(portfolio_id),
    event_type   TEXT NOT NULL,
    symbol       TEXT NOT NULL,
    quantity     TEXT NOT NULL,
    price        TEXT NOT NULL,
    fee          TEXT NOT NULL,
    tax          TEXT NOT NULL,
    total_amount TEXT NOT NULL,
    occurred_at  TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    source       TEXT NOT NULL,
    notes        TEXT,
    payload      TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_portfolio
    ON ledger_events(portfolio_id, recorded_at DESC);
CREATE INDEX IF NOT EXISTS idx_events_symbol
    ON ledger_events(portfolio_id, symbol, recorded_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    portfolio_id       TEXT NOT NULL,
    symbol             TEXT NOT NULL,
    total_quantity     TEXT NOT NULL,
    total_cost         TEXT NOT NULL,
    avg_cost_per_share TEXT NOT NULL,
    last_updated       TEXT NOT NULL,
    PRIMARY KEY (portfolio_id, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS tax_lots (
    lot_id             TEXT PRIMARY KEY,
    portfolio_id       TEXT NOT NULL,
    symbol             TEXT NOT NULL,
    buy_event_id       TEXT NOT NULL REFERENCES ledger_events(event_id),
    purchase_date      TEXT NOT NULL,
    purchase_price     TEXT NOT NULL,
    original_quantity  TEXT NOT NULL,
    remaining_quantity TEXT NOT NULL,
    is_closed          INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_lots_open
    ON tax_lots(portfolio_id, symbol, is_closed, purchase_date);

CREATE TABLE IF NOT EXISTS realized_pnl (
    id                   TEXT PRIMARY KEY,
    portfolio_id         TEXT NOT NULL,
    symbol               TEXT NOT NULL,
    buy_event_id         TEXT NOT NULL,
    sell_event_id        TEXT NOT NULL,
    quantity             TEXT NOT NULL,
    buy_price            TEXT NOT NULL,
    sell_price           TEXT NOT NULL,
    allocated_fees_taxes TEXT NOT NULL,
    realized_pnl         TEXT NOT NULL,
    holding_days         INTEGER NOT NULL,
    created_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_realized_portfolio
    ON realized_pnl(portfolio_id, symbol);

CREATE TABLE IF NOT EXISTS corporate_actions (
    action_id          TEXT PRIMARY KEY,
    symbol             TEXT NOT NULL,
    action_type        TEXT NOT NULL,
    announcement_date  TEXT,
    ex_date            TEXT,
    record_date        TEXT,
    payment_date       TEXT,
    cash_dividend      TEXT,
    stock_dividend     TEXT,
    split_ratio        TEXT,
    rights_ratio       TEXT,
    subscription_price TEXT,
    adjustment_factor  TEXT
);

CREATE INDEX IF NOT EXISTS idx_corporate_symbol
    ON corporate_actions(symbol, ex_date);

CREATE TABLE IF NOT EXISTS ohlcv_daily (
    symbol   TEXT NOT NULL,
    ts       TEXT NOT NULL,
    open     TEXT NOT NULL,
    high     TEXT NOT NULL,
    low      TEXT NOT NULL,
    close    TEXT NOT NULL,
    volume   INTEGER NOT NULL,
    turnover TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ohlcv_daily_ts ON ohlcv_daily(ts);

CREATE TABLE IF NOT EXISTS ohlcv_weekly (
    symbol   TEXT NOT NULL,
    ts       TEXT NOT NULL,
    open     TEXT NOT NULL,
    high     TEXT NOT NULL,
    low      TEXT NOT NULL,
    close    TEXT NOT NULL,
    volume   INTEGER NOT NULL,
    turnover TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ohlcv_monthly (
    symbol   TEXT NOT NULL,
    ts       TEXT NOT NULL,
    open     TEXT NOT NULL,
    high     TEXT NOT NULL,
    low      TEXT NOT NULL,
    close    TEXT NOT NULL,
    volume   INTEGER NOT NULL,
    turnover TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS indicator_cache (
    cache_key     TEXT PRIMARY KEY,
    symbol        TEXT NOT NULL,
    data          TEXT NOT NULL,
    calculated_at TEXT NOT NULL,
    expires_at    TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_indicator_symbol ON indicator_cache(symbol);
"#;

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply database schema")?;

        info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read (or single-statement write) against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction. Commit on `Ok`, rollback on `Err` (the
    /// transaction is dropped unfinished, which rolls back).
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// =============================================================================
// Column codecs
// =============================================================================

/// Render a decimal for storage.
pub fn dec_to_sql(value: &Decimal) -> String {
    value.to_string()
}

/// Parse a TEXT column back into a decimal inside a row-mapping closure.
///
/// `idx` is the column index, used only for the error payload.
pub fn dec_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn schema_applies_cleanly() {
        let db = Database::open_in_memory().unwrap();
        // Reapplying must be a no-op.
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), CoreError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO portfolios (portfolio_id, user_id, name, currency, created_at)
                 VALUES ('p1', 'u1', 'test', 'TWD', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(CoreError::validation("forced failure"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM portfolios", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn tx_commits_on_ok() {
        let db = Database::open_in_memory().unwrap();

        db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO portfolios (portfolio_id, user_id, name, currency, created_at)
                 VALUES ('p1', 'u1', 'test', 'TWD', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM portfolios", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn decimal_codec_roundtrip() {
        let d = dec!(580826.50);
        assert_eq!(dec_from_sql(0, &dec_to_sql(&d)).unwrap(), d);
        assert!(dec_from_sql(0, "not a number").is_err());
    }
}
