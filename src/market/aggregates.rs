// =============================================================================
// Rollups — weekly and monthly aggregates over the daily table
// =============================================================================
//
// Bucket boundaries follow calendar weeks (Monday-keyed) and months in the
// domain time zone; daily rows already carry the Taipei trading day, so the
// bucket math is pure date arithmetic.
//
// Per bucket: open = first by date, close = last by date, high = max,
// low = min, volume and turnover sum.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;

use crate::errors::CoreError;
use crate::market::bars::{map_bar_row, upsert_into, OhlcvBar};

/// Monday of the week containing `date`.
pub(crate) fn week_start(date: NaiveDate) -> NaiveDate {
    let back = date.weekday().num_days_from_monday() as i64;
    date - chrono::Duration::days(back)
}

/// First day of the month containing `date`.
pub(crate) fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is always valid")
}

/// Fold daily bars (chronological within a symbol) into bucketed rollups.
fn roll_up(bars: &[OhlcvBar], bucket: fn(NaiveDate) -> NaiveDate) -> Vec<OhlcvBar> {
    // BTreeMap keeps (symbol, bucket) output deterministic.
    let mut buckets: BTreeMap<(String, NaiveDate), OhlcvBar> = BTreeMap::new();

    for bar in bars {
        let key = (bar.symbol.clone(), bucket(bar.ts));
        match buckets.get_mut(&key) {
            None => {
                let mut agg = bar.clone();
                agg.ts = key.1;
                buckets.insert(key, agg);
            }
            Some(agg) => {
                // Bars arrive in ascending date order, so the running value
                // keeps the first open and takes every later close.
                agg.close = bar.close;
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.volume += bar.volume;
                agg.turnover += bar.turnover;
            }
        }
    }

    buckets.into_values().collect()
}

/// Rebuild the weekly and monthly tables from the daily table. Safe to call
/// concurrently with writes: it runs inside the caller's transaction and
/// upserts per (symbol, bucket).
pub(crate) fn refresh(conn: &Connection) -> Result<(usize, usize), CoreError> {
    let mut stmt = conn.prepare(
        "SELECT symbol, ts, open, high, low, close, volume, turnover
         FROM ohlcv_daily ORDER BY symbol ASC, ts ASC",
    )?;
    let daily = stmt
        .query_map([], map_bar_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let weekly = roll_up(&daily, week_start);
    let monthly = roll_up(&daily, month_start);

    let w = upsert_into(conn, "ohlcv_weekly", &weekly)?;
    let m = upsert_into(conn, "ohlcv_monthly", &monthly)?;
    Ok((w, m))
}

/// Delete raw daily bars older than `cutoff`. Rollups are retained.
pub(crate) fn evict_raw_before(conn: &Connection, cutoff: NaiveDate) -> Result<usize, CoreError> {
    let deleted = conn.execute(
        "DELETE FROM ohlcv_daily WHERE ts < ?1",
        [cutoff.to_string()],
    )?;
    Ok(deleted)
}
