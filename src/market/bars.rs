// =============================================================================
// OHLCV Bars — durable daily price history
// =============================================================================
//
// One row per (symbol, trading day). Writes are idempotent upserts so a
// re-ingested day simply overwrites (exchange corrections included). Reads are
// newest-first within a date window.
// =============================================================================

use chrono::NaiveDate;
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::storage::db::{dec_from_sql, dec_to_sql};

// =============================================================================
// Models
// =============================================================================

/// A (symbol, day) price/volume tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub symbol: String,
    pub ts: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub turnover: Decimal,
}

impl OhlcvBar {
    /// Bar invariant: `low ≤ min(open, close) ≤ max(open, close) ≤ high`,
    /// volume and turnover non-negative.
    pub fn validate(&self) -> Result<(), CoreError> {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);

        if self.low > body_low || body_high > self.high {
            return Err(CoreError::validation(format!(
                "bar {} {} violates low <= open/close <= high",
                self.symbol, self.ts
            )));
        }
        if self.volume < 0 || self.turnover < Decimal::ZERO {
            return Err(CoreError::validation(format!(
                "bar {} {} has negative volume or turnover",
                self.symbol, self.ts
            )));
        }
        Ok(())
    }
}

/// Which rollup a read is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Daily,
    Weekly,
    Monthly,
}

impl Timeframe {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw {
            "1d" => Ok(Self::Daily),
            "1w" => Ok(Self::Weekly),
            "1m" => Ok(Self::Monthly),
            other => Err(CoreError::validation(format!(
                "unknown timeframe '{other}': expected 1d, 1w, or 1m"
            ))),
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Daily => "ohlcv_daily",
            Self::Weekly => "ohlcv_weekly",
            Self::Monthly => "ohlcv_monthly",
        }
    }
}

// =============================================================================
// SQL
// =============================================================================

pub(crate) fn upsert_into(
    conn: &rusqlite::Connection,
    table: &str,
    bars: &[OhlcvBar],
) -> Result<usize, CoreError> {
    let sql = format!(
        "INSERT INTO {table} (symbol, ts, open, high, low, close, volume, turnover)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(symbol, ts) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            turnover = excluded.turnover"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let mut written = 0;
    for bar in bars {
        bar.validate()?;
        stmt.execute(params![
            bar.symbol,
            bar.ts.to_string(),
            dec_to_sql(&bar.open),
            dec_to_sql(&bar.high),
            dec_to_sql(&bar.low),
            dec_to_sql(&bar.close),
            bar.volume,
            dec_to_sql(&bar.turnover),
        ])?;
        written += 1;
    }
    Ok(written)
}

pub(crate) fn select_window(
    conn: &rusqlite::Connection,
    table: &str,
    symbol: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: usize,
) -> Result<Vec<OhlcvBar>, CoreError> {
    let sql = format!(
        "SELECT symbol, ts, open, high, low, close, volume, turnover
         FROM {table}
         WHERE symbol = ?1
           AND (?2 IS NULL OR ts >= ?2)
           AND (?3 IS NULL OR ts <= ?3)
         ORDER BY ts DESC
         LIMIT ?4"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let rows = stmt
        .query_map(
            params![
                symbol,
                from.map(|d| d.to_string()),
                to.map(|d| d.to_string()),
                limit as i64
            ],
            map_bar_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn map_bar_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OhlcvBar> {
    let ts: String = row.get(1)?;
    let open: String = row.get(2)?;
    let high: String = row.get(3)?;
    let low: String = row.get(4)?;
    let close: String = row.get(5)?;
    let turnover: String = row.get(7)?;

    Ok(OhlcvBar {
        symbol: row.get(0)?,
        ts: parse_date(1, &ts)?,
        open: dec_from_sql(2, &open)?,
        high: dec_from_sql(3, &high)?,
        low: dec_from_sql(4, &low)?,
        close: dec_from_sql(5, &close)?,
        volume: row.get(6)?,
        turnover: dec_from_sql(7, &turnover)?,
    })
}

pub(crate) fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    raw.parse::<NaiveDate>().map_err(|e| {
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

    fn bar(symbol: &str, ts: &str, close: Decimal) -> OhlcvBar {
        OhlcvBar {
            symbol: symbol.to_string(),
            ts: ts.parse().unwrap(),
            open: close - dec!(1),
            high: close + dec!(2),
            low: close - dec!(2),
            close,
            volume: 1000,
            turnover: close * dec!(1000),
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar("2330", "2024-01-02", dec!(580)).validate().is_ok());
    }

    #[test]
    fn inverted_range_rejected() {
        let mut b = bar("2330", "2024-01-02", dec!(580));
        b.low = dec!(600);
        assert!(b.validate().is_err());
    }

    #[test]
    fn close_above_high_rejected() {
        let mut b = bar("2330", "2024-01-02", dec!(580));
        b.high = dec!(579);
        assert!(b.validate().is_err());
    }

    #[test]
    fn negative_volume_rejected() {
        let mut b = bar("2330", "2024-01-02", dec!(580));
        b.volume = -1;
        assert!(b.validate().is_err());
    }

    #[test]
    fn timeframe_parse() {
        assert_eq!(Timeframe::parse("1d").unwrap(), Timeframe::Daily);
        assert_eq!(Timeframe::parse("1w").unwrap(), Timeframe::Weekly);
        assert_eq!(Timeframe::parse("1m").unwrap(), Timeframe::Monthly);
        assert!(Timeframe::parse("5m").is_err());
    }
}
