// =============================================================================
// Market Data Store — durable OHLCV history with rollups
// =============================================================================

pub mod aggregates;
pub mod bars;
pub mod corporate;

use chrono::NaiveDate;
use rusqlite::params;
use tracing::info;

use crate::errors::CoreError;
use crate::storage::Database;
use crate::symbol;

pub use bars::{OhlcvBar, Timeframe};
pub use corporate::{CorporateAction, CorporateActionType};

#[derive(Clone)]
pub struct MarketStore {
    db: Database,
}

impl MarketStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Idempotent batch upsert keyed by (symbol, day); later writes with the
    /// same key overwrite earlier ones. The whole batch is one transaction.
    pub fn upsert_bars(&self, bars: &[OhlcvBar]) -> Result<usize, CoreError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let written = self
            .db
            .with_tx(|tx| bars::upsert_into(tx, "ohlcv_daily", bars))?;
        info!(rows = written, "daily bars upserted");
        Ok(written)
    }

    /// Rebuild weekly/monthly rollups from the daily table.
    pub fn refresh_aggregates(&self) -> Result<(), CoreError> {
        let (weekly, monthly) = self.db.with_tx(|tx| aggregates::refresh(tx))?;
        info!(weekly, monthly, "rollups refreshed");
        Ok(())
    }

    /// Drop raw daily bars older than `cutoff`; rollups are retained.
    pub fn evict_raw_before(&self, cutoff: NaiveDate) -> Result<usize, CoreError> {
        let deleted = self
            .db
            .with_conn(|conn| aggregates::evict_raw_before(conn, cutoff))?;
        if deleted > 0 {
            info!(deleted, %cutoff, "raw bars evicted past retention horizon");
        }
        Ok(deleted)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Newest-first bars within the window, served from the table that
    /// matches `timeframe`.
    pub fn get_bars(
        &self,
        raw_symbol: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
        timeframe: Timeframe,
    ) -> Result<Vec<OhlcvBar>, CoreError> {
        let sym = symbol::canonicalize(raw_symbol)?;
        self.db.with_conn(|conn| {
            bars::select_window(conn, timeframe.table(), &sym, from, to, limit)
        })
    }

    /// Distinct row count per trading day over a window. The ingestion worker
    /// uses this to tell complete days from partial ones.
    pub fn count_bars_per_day(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, u64)>, CoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, COUNT(*) FROM ohlcv_daily
                 WHERE ts >= ?1 AND ts <= ?2
                 GROUP BY ts ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![from.to_string(), to.to_string()], |row| {
                    let ts: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((bars::parse_date(0, &ts)?, count as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Row count for a single trading day.
    pub fn count_bars_on(&self, day: NaiveDate) -> Result<u64, CoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM ohlcv_daily WHERE ts = ?1",
                [day.to_string()],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Earliest and latest stored trading day, if any bars exist.
    pub fn day_bounds(&self) -> Result<Option<(NaiveDate, NaiveDate)>, CoreError> {
        self.db.with_conn(|conn| {
            let bounds: (Option<String>, Option<String>) = conn.query_row(
                "SELECT MIN(ts), MAX(ts) FROM ohlcv_daily",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            match bounds {
                (Some(min), Some(max)) => Ok(Some((
                    bars::parse_date(0, &min)?,
                    bars::parse_date(1, &max)?,
                ))),
                _ => Ok(None),
            }
        })
    }

    /// Symbols with at least one daily bar on or after `since`.
    pub fn list_symbols_with_recent_data(
        &self,
        since: NaiveDate,
    ) -> Result<Vec<String>, CoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT symbol FROM ohlcv_daily WHERE ts >= ?1 ORDER BY symbol ASC",
            )?;
            let rows = stmt
                .query_map([since.to_string()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ── Corporate actions (reference data) ──────────────────────────────

    /// Loader path for the external corporate-action feed.
    pub fn load_corporate_actions(
        &self,
        actions: &[CorporateAction],
    ) -> Result<usize, CoreError> {
        self.db.with_tx(|tx| {
            let mut written = 0;
            for action in actions {
                corporate::upsert(tx, action)?;
                written += 1;
            }
            Ok(written)
        })
    }

    pub fn list_corporate_actions(
        &self,
        raw_symbol: &str,
    ) -> Result<Vec<CorporateAction>, CoreError> {
        let sym = symbol::canonicalize(raw_symbol)?;
        self.db
            .with_conn(|conn| corporate::list_for_symbol(conn, &sym))
    }
}
